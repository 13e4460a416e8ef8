//! Pass/fail conditions over aggregated metrics.
//!
//! A threshold is written the same way in config files and on the command line:
//!
//! ```text
//! http_req_failed           rate<0.01
//! http_req_duration         p(95)<800
//! http_req_duration{status:201}  avg<=200
//! ```
//!
//! The left side selects a metric (optionally narrowed by tags), the right side an
//! aggregation, a comparator and a bound. Durations are compared in milliseconds.
//!
//! Aggregations that are undefined on an empty set (everything except `count`)
//! are vacuously satisfied: a run that never recorded a request cannot fail a
//! `rate<0.01` threshold.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    collector::{Sample, Snapshot},
    error::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Aggregation {
    /// Fraction of samples whose outcome is a failure.
    Rate,
    /// Nearest-rank percentile of the durations, `0.0..=100.0`.
    Percentile(f64),
    Avg,
    Min,
    Max,
    Med,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    // longest tokens first so `<=` is not read as `<`
    const TOKENS: [(&'static str, Comparator); 6] = [
        ("<=", Comparator::Le),
        (">=", Comparator::Ge),
        ("==", Comparator::Eq),
        ("!=", Comparator::Ne),
        ("<", Comparator::Lt),
        (">", Comparator::Gt),
    ];

    pub fn compare(self, value: f64, bound: f64) -> bool {
        match self {
            Comparator::Lt => value < bound,
            Comparator::Le => value <= bound,
            Comparator::Gt => value > bound,
            Comparator::Ge => value >= bound,
            Comparator::Eq => value == bound,
            Comparator::Ne => value != bound,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Rate => f.write_str("rate"),
            Aggregation::Percentile(p) => write!(f, "p({p})"),
            Aggregation::Avg => f.write_str("avg"),
            Aggregation::Min => f.write_str("min"),
            Aggregation::Max => f.write_str("max"),
            Aggregation::Med => f.write_str("med"),
            Aggregation::Count => f.write_str("count"),
        }
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let aggregation = match s {
            "rate" => Aggregation::Rate,
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            "count" => Aggregation::Count,
            _ => {
                let inner = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown aggregation `{s}`"))?;
                let p: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| format!("percentile `{inner}` is not a number"))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile {p} is outside 0..=100"));
                }
                Aggregation::Percentile(p)
            }
        };
        Ok(aggregation)
    }
}

/// One threshold: `metric{tags} aggregation comparator bound`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSpec {
    pub metric: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub aggregation: Aggregation,
    pub comparator: Comparator,
    pub bound: f64,
}

impl ThresholdSpec {
    pub fn new(
        metric: impl Into<String>,
        aggregation: Aggregation,
        comparator: Comparator,
        bound: f64,
    ) -> Self {
        Self {
            metric: metric.into(),
            tags: BTreeMap::new(),
            aggregation,
            comparator,
            bound,
        }
    }

    /// Parses a metric key (`name` or `name{k:v,...}`) and an expression such as
    /// `p(95)<800`.
    pub fn parse(metric: &str, expression: &str) -> Result<Self> {
        let invalid = |reason: String| Error::Threshold {
            metric: metric.to_owned(),
            expression: expression.to_owned(),
            reason,
        };

        let (name, tags) = parse_metric_key(metric).map_err(invalid)?;

        let (idx, token, comparator) = Comparator::TOKENS
            .iter()
            .filter_map(|(token, cmp)| expression.find(token).map(|idx| (idx, *token, *cmp)))
            // earliest match wins, longer token on a tie
            .min_by_key(|(idx, token, _)| (*idx, usize::MAX - token.len()))
            .ok_or_else(|| invalid("missing comparator".to_owned()))?;

        let aggregation: Aggregation = expression[..idx].parse().map_err(invalid)?;
        let raw_bound = expression[idx + token.len()..].trim();
        let bound: f64 = raw_bound
            .parse()
            .map_err(|_| invalid(format!("bound `{raw_bound}` is not a number")))?;
        if !bound.is_finite() {
            return Err(invalid(format!("bound `{raw_bound}` is not finite")));
        }

        Ok(Self {
            metric: name,
            tags,
            aggregation,
            comparator,
            bound,
        })
    }

    /// The expression part, e.g. `p(95)<800`.
    pub fn expression(&self) -> String {
        format!("{}{}{}", self.aggregation, self.comparator.as_str(), self.bound)
    }

    /// The metric key including the tag filter, e.g. `http_req_duration{status:201}`.
    pub fn key(&self) -> String {
        if self.tags.is_empty() {
            return self.metric.clone();
        }
        let tags: Vec<String> = self.tags.iter().map(|(k, v)| format!("{k}:{v}")).collect();
        format!("{}{{{}}}", self.metric, tags.join(","))
    }
}

impl fmt::Display for ThresholdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key(), self.expression())
    }
}

fn parse_metric_key(key: &str) -> Result<(String, BTreeMap<String, String>), String> {
    let key = key.trim();
    let Some(open) = key.find('{') else {
        if key.is_empty() {
            return Err("empty metric name".to_owned());
        }
        return Ok((key.to_owned(), BTreeMap::new()));
    };

    let name = key[..open].trim();
    if name.is_empty() {
        return Err("empty metric name".to_owned());
    }
    let body = key[open + 1..]
        .strip_suffix('}')
        .ok_or_else(|| "unterminated tag filter".to_owned())?;

    let mut tags = BTreeMap::new();
    for pair in body.split(',').filter(|p| !p.trim().is_empty()) {
        let (k, v) = pair
            .split_once(':')
            .ok_or_else(|| format!("tag filter `{pair}` is not `key:value`"))?;
        tags.insert(k.trim().to_owned(), v.trim().to_owned());
    }
    Ok((name.to_owned(), tags))
}

/// Outcome of one threshold against a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    /// `None` when the aggregate is undefined (no samples).
    pub value: Option<f64>,
    pub passed: bool,
}

/// Evaluates thresholds against one frozen [`Snapshot`].
#[derive(Debug, Clone, Copy)]
pub struct ThresholdEvaluator<'a> {
    snapshot: &'a Snapshot,
}

impl<'a> ThresholdEvaluator<'a> {
    pub fn new(snapshot: &'a Snapshot) -> Self {
        Self { snapshot }
    }

    pub fn evaluate(&self, spec: &ThresholdSpec) -> ThresholdResult {
        let samples: Vec<&Sample> = self
            .snapshot
            .samples(&spec.metric)
            .iter()
            .filter(|s| s.matches(&spec.tags))
            .collect();

        let value = aggregate(spec.aggregation, &samples);
        let passed = match value {
            Some(v) => spec.comparator.compare(v, spec.bound),
            None => {
                tracing::debug!("No samples for threshold {spec}, treating as passed");
                true
            }
        };

        ThresholdResult {
            metric: spec.key(),
            expression: spec.expression(),
            value,
            passed,
        }
    }

    pub fn evaluate_all(&self, specs: &[ThresholdSpec]) -> Vec<ThresholdResult> {
        specs.iter().map(|spec| self.evaluate(spec)).collect()
    }
}

fn aggregate(aggregation: Aggregation, samples: &[&Sample]) -> Option<f64> {
    if let Aggregation::Count = aggregation {
        return Some(samples.len() as f64);
    }
    if samples.is_empty() {
        return None;
    }

    let n = samples.len() as f64;
    let value = match aggregation {
        Aggregation::Rate => {
            samples.iter().filter(|s| s.outcome.is_failure()).count() as f64 / n
        }
        Aggregation::Avg => samples.iter().map(|s| millis(s)).sum::<f64>() / n,
        Aggregation::Min => samples.iter().map(|s| millis(s)).fold(f64::INFINITY, f64::min),
        Aggregation::Max => samples
            .iter()
            .map(|s| millis(s))
            .fold(f64::NEG_INFINITY, f64::max),
        Aggregation::Med => percentile(&sorted_millis(samples), 50.0)?,
        Aggregation::Percentile(p) => percentile(&sorted_millis(samples), p)?,
        Aggregation::Count => unreachable!("handled above"),
    };
    Some(value)
}

fn millis(sample: &Sample) -> f64 {
    sample.duration.as_nanos() as f64 / 1_000_000.0
}

fn sorted_millis(samples: &[&Sample]) -> Vec<f64> {
    let mut values: Vec<f64> = samples.iter().map(|s| millis(s)).collect();
    values.sort_by(f64::total_cmp);
    values
}

/// Nearest-rank percentile over ascending `sorted` values:
/// index = ceil(p / 100 * n) - 1, clamped to `[0, n - 1]`.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    // multiply before dividing, `0.95 * 5` is not exact but `95 * 5 / 100` is
    let rank = (p * n as f64 / 100.0).ceil() as isize - 1;
    let idx = rank.clamp(0, n as isize - 1) as usize;
    Some(sorted[idx])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::collector::{
        HTTP_REQ_DURATION, HTTP_REQ_FAILED, MetricCollector, Outcome, Sample,
    };

    fn snapshot_with(metric: &str, samples: &[(u64, Outcome)]) -> Snapshot {
        let collector = MetricCollector::new();
        for (ms, outcome) in samples {
            collector.record(
                metric,
                Sample::new(Duration::ZERO, Duration::from_millis(*ms), *outcome),
            );
        }
        collector.snapshot()
    }

    mod parse {
        use super::*;

        #[test]
        fn rate_and_percentile() {
            let rate = ThresholdSpec::parse("http_req_failed", "rate<0.01").unwrap();
            assert_eq!(rate.metric, HTTP_REQ_FAILED);
            assert_eq!(rate.aggregation, Aggregation::Rate);
            assert_eq!(rate.comparator, Comparator::Lt);
            assert_eq!(rate.bound, 0.01);

            let p95 = ThresholdSpec::parse("http_req_duration", "p(95) < 800").unwrap();
            assert_eq!(p95.aggregation, Aggregation::Percentile(95.0));
            assert_eq!(p95.bound, 800.0);
            assert_eq!(p95.expression(), "p(95)<800");
        }

        #[test]
        fn two_char_comparators_are_not_split() {
            let cases = [
                ("avg<=200", Comparator::Le),
                ("max>=1", Comparator::Ge),
                ("count==10", Comparator::Eq),
                ("min!=0", Comparator::Ne),
                ("med>3", Comparator::Gt),
            ];
            for (expr, expected) in cases {
                let spec = ThresholdSpec::parse("m", expr).unwrap();
                assert_eq!(spec.comparator, expected, "{expr}");
            }
        }

        #[test]
        fn tag_filter() {
            let spec =
                ThresholdSpec::parse("http_req_duration{status:201, vu:1}", "p(99.9)<1500")
                    .unwrap();
            assert_eq!(spec.metric, HTTP_REQ_DURATION);
            assert_eq!(spec.tags["status"], "201");
            assert_eq!(spec.tags["vu"], "1");
            assert_eq!(spec.aggregation, Aggregation::Percentile(99.9));
            assert_eq!(spec.key(), "http_req_duration{status:201,vu:1}");
        }

        #[test]
        fn malformed_expressions_are_rejected() {
            for expr in ["rate", "rate<", "rate<abc", "p(95", "p(101)<1", "avgs<1", "<1", "rate<inf"] {
                let err = ThresholdSpec::parse("m", expr).unwrap_err();
                assert!(
                    matches!(&err, Error::Threshold { expression, .. } if expression == expr),
                    "{expr}: {err}"
                );
            }
            assert!(ThresholdSpec::parse("m{status", "rate<1").is_err());
            assert!(ThresholdSpec::parse("", "rate<1").is_err());
        }
    }

    mod percentile {
        use super::*;

        #[test]
        fn nearest_rank_p95_of_five() {
            let sorted = [100.0, 200.0, 300.0, 400.0, 500.0];
            assert_eq!(percentile(&sorted, 95.0), Some(500.0));
            assert_eq!(percentile(&sorted, 50.0), Some(300.0));
            assert_eq!(percentile(&sorted, 60.0), Some(300.0));
            assert_eq!(percentile(&sorted, 61.0), Some(400.0));
            assert_eq!(percentile(&sorted, 0.0), Some(100.0));
            assert_eq!(percentile(&sorted, 100.0), Some(500.0));
        }

        #[test]
        fn empty_is_undefined() {
            assert_eq!(percentile(&[], 95.0), None);
        }

        #[test]
        fn unsorted_input_is_sorted_before_ranking() {
            let snapshot = snapshot_with(
                HTTP_REQ_DURATION,
                &[
                    (500, Outcome::Success),
                    (100, Outcome::Success),
                    (400, Outcome::Success),
                    (200, Outcome::Success),
                    (300, Outcome::Success),
                ],
            );
            let spec = ThresholdSpec::parse(HTTP_REQ_DURATION, "p(95)<800").unwrap();
            let result = ThresholdEvaluator::new(&snapshot).evaluate(&spec);
            assert_eq!(result.value, Some(500.0));
            assert!(result.passed);
        }
    }

    #[test]
    fn rate_with_zero_samples_passes() {
        let snapshot = Snapshot::default();
        let spec = ThresholdSpec::parse(HTTP_REQ_FAILED, "rate<0.01").unwrap();
        let result = ThresholdEvaluator::new(&snapshot).evaluate(&spec);

        assert_eq!(result.value, None);
        assert!(result.passed);
    }

    #[test]
    fn count_on_empty_is_zero_and_compared() {
        let snapshot = Snapshot::default();
        let spec = ThresholdSpec::parse(HTTP_REQ_FAILED, "count>0").unwrap();
        let result = ThresholdEvaluator::new(&snapshot).evaluate(&spec);

        assert_eq!(result.value, Some(0.0));
        assert!(!result.passed);
    }

    #[test]
    fn failure_rate() {
        let snapshot = snapshot_with(
            HTTP_REQ_FAILED,
            &[
                (10, Outcome::Failure),
                (10, Outcome::Success),
                (10, Outcome::Success),
                (10, Outcome::Success),
            ],
        );
        let evaluator = ThresholdEvaluator::new(&snapshot);

        let strict = evaluator.evaluate(&ThresholdSpec::parse(HTTP_REQ_FAILED, "rate<0.01").unwrap());
        assert_eq!(strict.value, Some(0.25));
        assert!(!strict.passed);

        let loose = evaluator.evaluate(&ThresholdSpec::parse(HTTP_REQ_FAILED, "rate<=0.25").unwrap());
        assert!(loose.passed);
    }

    #[test]
    fn duration_aggregations_in_millis() {
        let snapshot = snapshot_with(
            HTTP_REQ_DURATION,
            &[(10, Outcome::Success), (20, Outcome::Success), (60, Outcome::Failure)],
        );
        let evaluator = ThresholdEvaluator::new(&snapshot);
        let value = |expr: &str| {
            evaluator
                .evaluate(&ThresholdSpec::parse(HTTP_REQ_DURATION, expr).unwrap())
                .value
                .unwrap()
        };

        assert_eq!(value("avg<1"), 30.0);
        assert_eq!(value("min<1"), 10.0);
        assert_eq!(value("max<1"), 60.0);
        assert_eq!(value("med<1"), 20.0);
        assert_eq!(value("count<1"), 3.0);
    }

    #[test]
    fn tag_filter_narrows_samples() {
        let collector = MetricCollector::new();
        collector.record(
            HTTP_REQ_DURATION,
            Sample::new(Duration::ZERO, Duration::from_millis(900), Outcome::Failure)
                .with_tag("status", "500"),
        );
        collector.record(
            HTTP_REQ_DURATION,
            Sample::new(Duration::ZERO, Duration::from_millis(50), Outcome::Success)
                .with_tag("status", "201"),
        );
        let snapshot = collector.snapshot();
        let evaluator = ThresholdEvaluator::new(&snapshot);

        let ok = ThresholdSpec::parse("http_req_duration{status:201}", "max<100").unwrap();
        let all = ThresholdSpec::parse(HTTP_REQ_DURATION, "max<100").unwrap();
        let results = evaluator.evaluate_all(&[ok, all]);

        assert!(results[0].passed);
        assert_eq!(results[0].metric, "http_req_duration{status:201}");
        assert!(!results[1].passed);
    }
}
