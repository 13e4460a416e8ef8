use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, future::Future, path::PathBuf};

use crate::{
    collector::{MetricSeries, Snapshot},
    error::Result,
    executor::ExecutionStats,
    threshold::{ThresholdEvaluator, ThresholdResult, ThresholdSpec, percentile},
};

/// Exit code of a run whose thresholds did not all pass.
pub const THRESHOLDS_FAILED_EXIT_CODE: i32 = 99;

/// Statistics derived from one [`MetricSeries`]. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: usize,
    pub failures: usize,
    /// Failure fraction, `0.0` for an empty series.
    pub rate: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub med: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

impl From<&MetricSeries> for MetricSummary {
    fn from(series: &MetricSeries) -> Self {
        let mut millis: Vec<f64> = series
            .samples()
            .iter()
            .map(|s| s.duration.as_nanos() as f64 / 1_000_000.0)
            .collect();
        millis.sort_by(f64::total_cmp);

        let count = series.len();
        let failures = series.failures();
        let avg = (count > 0).then(|| millis.iter().sum::<f64>() / count as f64);
        Self {
            count,
            failures,
            rate: if count == 0 {
                0.0
            } else {
                failures as f64 / count as f64
            },
            min: millis.first().copied(),
            max: millis.last().copied(),
            avg,
            med: percentile(&millis, 50.0),
            p90: percentile(&millis, 90.0),
            p95: percentile(&millis, 95.0),
            p99: percentile(&millis, 99.0),
        }
    }
}

/// Final, immutable outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub scenario: String,
    /// True when every threshold passed.
    pub passed: bool,
    pub thresholds: Vec<ThresholdResult>,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub execution: ExecutionStats,
}

impl RunResult {
    pub fn new(
        scenario: &str,
        snapshot: &Snapshot,
        thresholds: &[ThresholdSpec],
        execution: ExecutionStats,
    ) -> Self {
        let thresholds = ThresholdEvaluator::new(snapshot).evaluate_all(thresholds);
        for failed in thresholds.iter().filter(|t| !t.passed) {
            tracing::warn!(
                "Threshold crossed: {} {} (value: {:?})",
                failed.metric,
                failed.expression,
                failed.value
            );
        }
        Self {
            scenario: scenario.to_owned(),
            passed: thresholds.iter().all(|t| t.passed),
            thresholds,
            metrics: snapshot
                .iter()
                .map(|(name, series)| (name.to_owned(), MetricSummary::from(series)))
                .collect(),
            execution,
        }
    }

    /// `0` when every threshold passed.
    pub fn exit_code(&self) -> i32 {
        if self.passed {
            0
        } else {
            THRESHOLDS_FAILED_EXIT_CODE
        }
    }

    /// Plain text summary, one line per threshold and per metric.
    pub fn summary(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "scenario: {}", self.scenario)?;
        let e = &self.execution;
        writeln!(
            f,
            "  vus: {} (peak {}), iterations: {}, elapsed: {:.1}s",
            e.vus,
            e.peak_vus,
            e.iterations,
            e.elapsed.as_secs_f64()
        )?;
        if e.force_stopped > 0 || e.panicked > 0 {
            writeln!(
                f,
                "  force stopped: {}, panicked: {}",
                e.force_stopped, e.panicked
            )?;
        }

        if !self.thresholds.is_empty() {
            writeln!(f, "\nthresholds:")?;
            for t in &self.thresholds {
                let mark = if t.passed { '✓' } else { '✗' };
                let value = t
                    .value
                    .map(|v| format!("{v:.4}"))
                    .unwrap_or_else(|| "no samples".to_owned());
                writeln!(f, "  {mark} {}: {} ({value})", t.metric, t.expression)?;
            }
        }

        writeln!(f, "\nmetrics:")?;
        let ms = |v: Option<f64>| v.map_or_else(|| "-".to_owned(), |v| format!("{v:.2}ms"));
        for (name, m) in &self.metrics {
            writeln!(
                f,
                "  {name:.<24} count={} failed={:.2}% avg={} min={} med={} max={} p(90)={} p(95)={}",
                m.count,
                m.rate * 100.0,
                ms(m.avg),
                ms(m.min),
                ms(m.med),
                ms(m.max),
                ms(m.p90),
                ms(m.p95),
            )?;
        }

        let verdict = if self.passed { "PASSED" } else { "FAILED" };
        writeln!(f, "\nresult: {verdict}")
    }
}

/// A [`Reporter`] sends a [`RunResult`] somewhere: stdout, a file, a service.
pub trait Reporter {
    fn report(&self, result: &RunResult) -> impl Future<Output = Result<()>>;
}

/// Prints the text summary.
pub struct StdoutReporter;

impl Reporter for StdoutReporter {
    async fn report(&self, result: &RunResult) -> Result<()> {
        println!("{}", result.summary());
        Ok(())
    }
}

/// Writes the result as pretty JSON.
pub struct JsonReporter {
    pub path: PathBuf,
}

impl JsonReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Reporter for JsonReporter {
    async fn report(&self, result: &RunResult) -> Result<()> {
        let json = serde_json::to_vec_pretty(result)?;
        tokio::fs::write(&self.path, json).await?;
        tracing::info!("Summary written to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::collector::{
        CHECKS, HTTP_REQ_DURATION, HTTP_REQ_FAILED, MetricCollector, Outcome, Sample,
    };

    fn snapshot() -> Snapshot {
        let collector = MetricCollector::new();
        for (ms, outcome) in [
            (100, Outcome::Success),
            (200, Outcome::Success),
            (300, Outcome::Failure),
            (400, Outcome::Success),
            (500, Outcome::Success),
        ] {
            let sample = Sample::new(Duration::ZERO, Duration::from_millis(ms), outcome);
            collector.record_batch([
                (HTTP_REQ_DURATION, sample.clone()),
                (HTTP_REQ_FAILED, sample),
            ]);
        }
        collector.snapshot()
    }

    fn thresholds(exprs: &[(&str, &str)]) -> Vec<ThresholdSpec> {
        exprs
            .iter()
            .map(|(m, e)| ThresholdSpec::parse(m, e).unwrap())
            .collect()
    }

    #[test]
    fn summary_statistics() {
        let snapshot = snapshot();
        let summary = MetricSummary::from(snapshot.series(HTTP_REQ_DURATION).unwrap());

        assert_eq!(summary.count, 5);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.rate, 0.2);
        assert_eq!(summary.min, Some(100.0));
        assert_eq!(summary.max, Some(500.0));
        assert_eq!(summary.avg, Some(300.0));
        assert_eq!(summary.med, Some(300.0));
        assert_eq!(summary.p95, Some(500.0));
    }

    #[test]
    fn empty_series_has_no_latency_stats() {
        let summary = MetricSummary::from(&MetricSeries::default());
        assert_eq!(summary.count, 0);
        assert_eq!(summary.rate, 0.0);
        assert_eq!(summary.avg, None);
        assert_eq!(summary.p95, None);
    }

    #[test]
    fn any_failed_threshold_fails_the_run() {
        let snapshot = snapshot();
        let passing = RunResult::new(
            "s",
            &snapshot,
            &thresholds(&[(HTTP_REQ_DURATION, "p(95)<800")]),
            ExecutionStats::default(),
        );
        assert!(passing.passed);
        assert_eq!(passing.exit_code(), 0);

        let failing = RunResult::new(
            "s",
            &snapshot,
            &thresholds(&[(HTTP_REQ_DURATION, "p(95)<800"), (HTTP_REQ_FAILED, "rate<0.01")]),
            ExecutionStats::default(),
        );
        assert!(!failing.passed);
        assert!(failing.thresholds[0].passed);
        assert_eq!(failing.exit_code(), THRESHOLDS_FAILED_EXIT_CODE);
    }

    #[test]
    fn no_thresholds_passes() {
        let result = RunResult::new("s", &Snapshot::default(), &[], ExecutionStats::default());
        assert!(result.passed);
        assert!(result.metrics.is_empty());
    }

    #[test]
    fn summary_lists_thresholds_and_metrics() {
        let snapshot = snapshot();
        let result = RunResult::new(
            "smoke",
            &snapshot,
            &thresholds(&[(HTTP_REQ_FAILED, "rate<0.01"), (CHECKS, "rate<0.1")]),
            ExecutionStats::default(),
        );
        let text = result.summary();

        assert!(text.contains("scenario: smoke"));
        assert!(text.contains("✗ http_req_failed: rate<0.01 (0.2000)"));
        assert!(text.contains("✓ checks: rate<0.1 (no samples)"));
        assert!(text.contains("http_req_duration"));
        assert!(text.contains("result: FAILED"));
    }

    #[test]
    fn display_matches_summary_and_lists_stopped_users() {
        let result = RunResult::new(
            "stuck",
            &Snapshot::default(),
            &[],
            ExecutionStats {
                vus: 2,
                force_stopped: 2,
                ..Default::default()
            },
        );
        let text = format!("{result}");
        assert_eq!(text, result.summary());
        assert!(text.contains("force stopped: 2, panicked: 0"));
        assert!(text.ends_with("result: PASSED\n"));
    }

    #[tokio::test]
    async fn json_reporter_round_trips() {
        let snapshot = snapshot();
        let result = RunResult::new(
            "json",
            &snapshot,
            &thresholds(&[(HTTP_REQ_FAILED, "rate<0.5")]),
            ExecutionStats::default(),
        );
        let path = std::env::temp_dir().join(format!("tropa-summary-{}.json", std::process::id()));

        JsonReporter::new(&path).report(&result).await.unwrap();
        let written = tokio::fs::read_to_string(&path).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        let parsed: RunResult = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed, result);
    }
}
