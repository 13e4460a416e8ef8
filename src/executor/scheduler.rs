use std::{future::Future, time::Duration};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, task::JoinHandle, time::Instant};
use typed_builder::TypedBuilder;

use super::{
    Executor,
    context::ExecutionContext,
    vu::{VirtualUser, VuSummary},
};
use crate::{
    collector::MetricCollector,
    config::Options,
    error::{Error, Result},
    report::RunResult,
    scenario::{Response, Scenario, ScenarioError},
    threshold::ThresholdSpec,
};

/// How long stopping users get to finish their iteration unless configured.
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);

/// What happened to the virtual users of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub vus: usize,
    /// Highest number of users running at the same time.
    pub peak_vus: usize,
    /// Completed iterations, including those of users that were later force
    /// stopped. Only the in-flight iteration of an aborted user is not counted.
    pub iterations: u64,
    /// Users aborted because they outlived the graceful stop period.
    pub force_stopped: usize,
    /// Users whose task panicked outside the scenario action.
    pub panicked: usize,
    pub elapsed: Duration,
}

/// Runs a fixed number of virtual users for a fixed duration.
///
/// All users start at once. When `duration` is over the scheduler broadcasts
/// shutdown and gives the users `graceful_stop` to finish the iteration they are
/// in. Users still running after that are aborted and whatever they were doing is
/// thrown away.
///
/// With `iterations` set, the users share that many iterations and the run ends as
/// soon as they are used up, or when `duration` is over, whichever comes first.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use tropa::{Response, Scenario, ScenarioError, Scheduler, ThresholdSpec};
///
/// # async fn run() -> tropa::Result<()> {
/// let scenario = Scenario::builder()
///     .name("ping")
///     .action(|| async { Ok::<_, ScenarioError>(Response::new(200, Duration::from_millis(5))) })
///     .think_time(Duration::from_secs(1))
///     .build();
/// let thresholds = vec![ThresholdSpec::parse("http_req_failed", "rate<0.01")?];
///
/// let result = Scheduler::builder()
///     .vus(5)
///     .duration(Duration::from_secs(30))
///     .build()
///     .run(&scenario, &thresholds)
///     .await?;
/// assert!(result.passed);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct Scheduler {
    /// Number of concurrent virtual users.
    pub vus: usize,
    /// How long users keep starting new iterations.
    pub duration: Duration,
    #[builder(default = DEFAULT_GRACEFUL_STOP)]
    pub graceful_stop: Duration,
    /// Iterations shared across all users.
    #[builder(default, setter(strip_option))]
    pub iterations: Option<u64>,
}

impl Scheduler {
    pub fn from_options(options: &Options) -> Self {
        Self {
            vus: options.vus,
            duration: options.duration,
            graceful_stop: options.graceful_stop,
            iterations: options.iterations,
        }
    }

    /// Executes the scenario on a fresh collector and evaluates `thresholds`
    /// against the final snapshot.
    pub async fn run<F, Fut>(
        &self,
        scenario: &Scenario<F, Fut>,
        thresholds: &[ThresholdSpec],
    ) -> Result<RunResult>
    where
        F: Fn() -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Response, ScenarioError>> + Send + 'static,
    {
        let collector = MetricCollector::new();
        let stats = self.exec(scenario, &collector).await?;
        let snapshot = collector.snapshot();
        tracing::info!("Evaluating {} thresholds...", thresholds.len());
        Ok(RunResult::new(&scenario.name, &snapshot, thresholds, stats))
    }

    fn validate(&self) -> Result<()> {
        if self.vus == 0 {
            return Err(Error::config("vus", "must be greater than zero"));
        }
        if self.duration.is_zero() {
            return Err(Error::config("duration", "must be greater than zero"));
        }
        if self.iterations == Some(0) {
            return Err(Error::config("iterations", "must be greater than zero"));
        }
        Ok(())
    }
}

impl<F, Fut> Executor<F, Fut> for Scheduler
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Response, ScenarioError>> + Send + 'static,
{
    type Error = Error;

    async fn exec(
        &self,
        scenario: &Scenario<F, Fut>,
        collector: &MetricCollector,
    ) -> Result<ExecutionStats> {
        self.validate()?;
        let handle = Handle::try_current().map_err(|e| Error::Spawn(e.to_string()))?;

        let started = Instant::now();
        let (ctx, shutdown_tx) = ExecutionContext::new(self.iterations);

        tracing::info!("Spawning {} virtual users...", self.vus);
        let handles = spawn_users(&handle, &ctx, self.vus, scenario, collector);
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        tracing::info!("Running scenario: {}!", scenario.name);
        let mut all = Box::pin(join_all(handles));
        let results = match tokio::time::timeout(self.duration, &mut all).await {
            Ok(results) => {
                tracing::info!("All virtual users finished before the duration elapsed.");
                results
            }
            Err(_) => {
                tracing::info!("Duration elapsed, signaling shutdown...");
                shutdown_tx.send_replace(true);
                match tokio::time::timeout(self.graceful_stop, &mut all).await {
                    Ok(results) => results,
                    Err(_) => {
                        tracing::warn!(
                            "{} virtual users still running after {:?}, aborting them.",
                            ctx.active(),
                            self.graceful_stop
                        );
                        aborts.iter().for_each(|abort| abort.abort());
                        all.await
                    }
                }
            }
        };

        tracing::info!("Collecting results from virtual users...");
        let mut stats = ExecutionStats {
            vus: self.vus,
            peak_vus: ctx.peak(),
            iterations: ctx.completed(),
            ..Default::default()
        };
        for result in results {
            match result {
                Ok(VuSummary { id, iterations }) => {
                    tracing::debug!("Virtual user {id} finished {iterations} iterations.");
                }
                Err(e) if e.is_cancelled() => stats.force_stopped += 1,
                Err(e) => {
                    // one broken user must not cost us the data of the others
                    tracing::error!("Virtual user panicked with error: {e}");
                    stats.panicked += 1;
                }
            }
        }
        stats.elapsed = started.elapsed();

        tracing::info!(
            "Done running scenario: {} ({} iterations in {:?})!",
            scenario.name,
            stats.iterations,
            stats.elapsed
        );
        Ok(stats)
    }
}

/// Spawns one task per virtual user on `handle`.
fn spawn_users<F, Fut>(
    handle: &Handle,
    ctx: &ExecutionContext,
    vus: usize,
    scenario: &Scenario<F, Fut>,
    collector: &MetricCollector,
) -> Vec<JoinHandle<VuSummary>>
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Response, ScenarioError>> + Send + 'static,
{
    (0..vus)
        .map(|id| {
            let vu = VirtualUser::new(id, scenario, collector.clone(), ctx.clone());
            handle.spawn(vu.run())
        })
        .collect()
}
