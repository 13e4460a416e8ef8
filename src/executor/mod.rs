//! Executor: orchestration of virtual users
//!
//! The `Executor` trait is the runtime hook that drives a `Scenario`. The built-in
//! [`Scheduler`] runs a constant number of [`VirtualUser`]s for a bounded duration
//! (optionally sharing an iteration budget) and feeds every sample into a
//! [`MetricCollector`].
//!
//! # High-level flow
//! 1. An [`ExecutionContext`] is created. It carries the shutdown broadcast
//!    (`tokio::sync::watch`), the running-user counters and the iteration budget.
//! 2. N user tasks are spawned at once. Each one repeatedly:
//!    - claims an iteration from the budget (if any),
//!    - calls the scenario action, classifies the response and records the samples,
//!    - sleeps for the think time, waking early on shutdown.
//! 3. When the duration elapses the scheduler flips the shutdown flag. Users finish
//!    the iteration they are in and exit.
//! 4. Users still running after the graceful stop period are aborted; their
//!    in-flight iteration never reaches the collector.
//!
//! # Common pitfalls
//! - **Do not block inside the action.** Use async clients; a blocking call stalls
//!   the worker thread and every user scheduled on it.
//! - **Build clients outside the action.** Create the HTTP client once and clone
//!   the handle into the closure.
pub mod context;
pub mod scheduler;
pub mod vu;

pub use context::ExecutionContext;
pub use scheduler::{ExecutionStats, Scheduler};
pub use vu::{VirtualUser, VuState};

use std::future::Future;

use crate::{
    collector::MetricCollector,
    scenario::{Response, Scenario, ScenarioError},
};

/// The runtime hook that executes a `Scenario`.
///
/// An executor decides how many users run, for how long and how they are stopped.
/// It writes samples into the collector it is given and reports what happened to
/// the users; evaluating the samples is left to the caller.
pub trait Executor<F, Fut>
where
    Self: Send + Sync + Sized,
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Response, ScenarioError>> + Send,
{
    type Error;

    /// Run the scenario to completion.
    fn exec(
        &self,
        scenario: &Scenario<F, Fut>,
        collector: &MetricCollector,
    ) -> impl Future<Output = Result<ExecutionStats, Self::Error>> + Send;
}
