//! Thread-safe sample storage for a single run.
//!
//! The [`MetricCollector`] is the only piece of state shared between virtual users.
//! Every user pushes [`Sample`]s into named series; once the run is over the
//! scheduler takes a [`Snapshot`] and hands it to the threshold evaluator and the
//! report. A snapshot is a deep copy, so nothing recorded later can change it.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Latency of each request.
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
/// Same samples as [`HTTP_REQ_DURATION`], meant for failure-rate thresholds.
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
/// Wall clock of one scenario call plus its checks. Think time is not included.
pub const ITERATION_DURATION: &str = "iteration_duration";
/// One sample per check per iteration, tagged with `check=<name>`.
pub const CHECKS: &str = "checks";

/// Whether a single observation counts as a success or a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn from_success(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }

    pub fn is_failure(self) -> bool {
        self == Outcome::Failure
    }
}

/// A single observation.
///
/// `at` is the offset from the start of the run, `duration` what was measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub at: Duration,
    pub duration: Duration,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl Sample {
    pub fn new(at: Duration, duration: Duration, outcome: Outcome) -> Self {
        Self {
            at,
            duration,
            outcome,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// True if every `(key, value)` in `filter` is present on this sample.
    pub fn matches(&self, filter: &BTreeMap<String, String>) -> bool {
        filter
            .iter()
            .all(|(k, v)| self.tags.get(k).is_some_and(|tag| tag == v))
    }
}

/// All samples recorded under one metric name, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    samples: Vec<Sample>,
}

impl MetricSeries {
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.samples
            .iter()
            .filter(|s| s.outcome.is_failure())
            .count()
    }

    pub fn successes(&self) -> usize {
        self.len() - self.failures()
    }
}

/// Frozen copy of every series at the moment it was taken.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    series: BTreeMap<String, MetricSeries>,
}

impl Snapshot {
    pub fn series(&self, name: &str) -> Option<&MetricSeries> {
        self.series.get(name)
    }

    /// Samples of `name`, empty if the metric was never written.
    pub fn samples(&self, name: &str) -> &[Sample] {
        self.series.get(name).map(|s| s.samples()).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricSeries)> {
        self.series.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn total_samples(&self) -> usize {
        self.series.values().map(MetricSeries::len).sum()
    }
}

/// Accumulates samples from any number of concurrent writers.
///
/// Cloning is cheap and yields a handle to the same storage.
#[derive(Debug, Clone)]
pub struct MetricCollector {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    origin: Instant,
    series: Mutex<HashMap<String, Vec<Sample>>>,
}

impl MetricCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                origin: Instant::now(),
                series: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Time since the collector was created. Used as the sample timestamp.
    pub fn elapsed(&self) -> Duration {
        self.inner.origin.elapsed()
    }

    pub fn record(&self, metric: &str, sample: Sample) {
        let mut series = self.inner.series.lock();
        push(&mut series, metric, sample);
    }

    /// Appends several samples while holding the lock once, so they become
    /// visible together.
    pub fn record_batch<'a>(&self, samples: impl IntoIterator<Item = (&'a str, Sample)>) {
        let mut series = self.inner.series.lock();
        for (metric, sample) in samples {
            push(&mut series, metric, sample);
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let series = self.inner.series.lock();
        Snapshot {
            series: series
                .iter()
                .map(|(name, samples)| {
                    (
                        name.clone(),
                        MetricSeries {
                            samples: samples.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

impl Default for MetricCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn push(series: &mut HashMap<String, Vec<Sample>>, metric: &str, sample: Sample) {
    match series.get_mut(metric) {
        Some(samples) => samples.push(sample),
        None => {
            series.insert(metric.to_owned(), vec![sample]);
        }
    }
}
