//! Tropa, a minimal load-test execution engine.
//!
//! Tropa runs a fixed number of virtual users against an async action for a bounded
//! time, records every call as a tagged sample and checks the results against
//! pass/fail thresholds written in a small expression language (`p(95)<800`,
//! `rate<0.01`). The outcome of a run is a single [`RunResult`] with an exit code
//! that CI can gate on.
//!
//! # Architecture
//!
//! - [`Scenario`]: the action to run plus how to judge it (classifier, checks, think
//!   time).
//! - [`Executor`]: drives a scenario. The built-in [`Scheduler`] spawns one
//!   [`VirtualUser`] task per VU, stops them when the duration expires and aborts
//!   whatever is left after the graceful stop period.
//! - [`MetricCollector`]: thread-safe, append-only store of [`Sample`]s keyed by
//!   metric name. Reads go through immutable [`Snapshot`]s.
//! - [`ThresholdEvaluator`]: aggregates a snapshot (rate, percentiles, avg, ...) and
//!   compares it against each [`ThresholdSpec`].
//! - [`Reporter`]: sends a [`RunResult`] somewhere (stdout, a JSON file).
//! - [`Options`]: run configuration resolved from JSON, CLI flags and environment.
//!
//! # Where to start
//!
//! Build a [`Scenario`], hand it to [`Scheduler::run`] together with the thresholds
//! and report the result:
//!
//! ```no_run
//! use std::time::Duration;
//! use tropa::{Reporter, Response, Scenario, ScenarioError, Scheduler, ThresholdSpec};
//! use tropa::report::StdoutReporter;
//!
//! # async fn run() -> tropa::Result<()> {
//! let scenario = Scenario::builder()
//!     .name("ping")
//!     .action(|| async { Ok::<_, ScenarioError>(Response::new(200, Duration::from_millis(12))) })
//!     .build();
//! let thresholds = vec![ThresholdSpec::parse("http_req_duration", "p(95)<800")?];
//!
//! let result = Scheduler::builder()
//!     .vus(5)
//!     .duration(Duration::from_secs(30))
//!     .build()
//!     .run(&scenario, &thresholds)
//!     .await?;
//! StdoutReporter.report(&result).await?;
//! std::process::exit(result.exit_code());
//! # }
//! ```

/// Sample storage
pub mod collector;
/// Run configuration
pub mod config;
pub mod error;
/// Virtual users and the scheduler that drives them
pub mod executor;
/// Run results and reporters
pub mod report;
/// What a virtual user executes
pub mod scenario;
/// Threshold expressions and their evaluation
pub mod threshold;

pub use collector::{MetricCollector, Outcome, Sample, Snapshot};
pub use config::{Options, RawOptions};
pub use error::{Error, Result};
pub use executor::{Executor, Scheduler, VirtualUser};
pub use report::{Reporter, RunResult};
pub use scenario::{Response, Scenario, ScenarioError};
pub use threshold::{ThresholdEvaluator, ThresholdSpec};
