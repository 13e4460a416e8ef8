use std::{future::Future, panic::AssertUnwindSafe, time::Duration};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::watch::{self, Receiver},
    time::Instant,
};

use super::context::{ExecutionContext, cancelled};
use crate::{
    collector::{
        CHECKS, HTTP_REQ_DURATION, HTTP_REQ_FAILED, ITERATION_DURATION, MetricCollector, Outcome,
        Sample,
    },
    scenario::{Check, Classifier, Response, Scenario, ScenarioError},
};

/// Lifecycle of a virtual user. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VuState {
    Idle,
    Running,
    /// Cancellation arrived, the current iteration is being finished.
    Stopping,
    Stopped,
}

/// What a virtual user did before it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VuSummary {
    pub id: usize,
    pub iterations: u64,
}

/// One simulated client running a [`Scenario`] in a loop.
///
/// Every iteration calls the action once, classifies the result, evaluates the
/// checks and records the samples in a single batch. Afterwards the user sleeps
/// for the scenario's think time. A pending shutdown interrupts that sleep but
/// never an action that is already running.
pub struct VirtualUser<F> {
    id: usize,
    name: String,
    action: F,
    classifier: Classifier,
    checks: Vec<Check>,
    think_time: Duration,
    collector: MetricCollector,
    ctx: ExecutionContext,
    state: watch::Sender<VuState>,
}

impl<F, Fut> VirtualUser<F>
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Response, ScenarioError>> + Send,
{
    pub fn new(
        id: usize,
        scenario: &Scenario<F, Fut>,
        collector: MetricCollector,
        ctx: ExecutionContext,
    ) -> Self {
        let (state, _) = watch::channel(VuState::Idle);
        Self {
            id,
            name: scenario.name.clone(),
            action: scenario.action.clone(),
            classifier: scenario.classifier.clone(),
            checks: scenario.checks.clone(),
            think_time: scenario.think_time,
            collector,
            ctx,
            state,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Observe state transitions of this user.
    pub fn subscribe(&self) -> Receiver<VuState> {
        self.state.subscribe()
    }

    pub async fn run(self) -> VuSummary {
        let mut shutdown = self.ctx.shutdown.clone();
        let _active = self.ctx.enter();
        self.state.send_replace(VuState::Running);
        tracing::debug!("Virtual user {} started.", self.id);

        let mut iterations = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            if !self.ctx.claim_iteration() {
                tracing::debug!("Virtual user {}: iteration budget exhausted.", self.id);
                break;
            }

            let iteration = self.iterate(iterations);
            tokio::pin!(iteration);
            tokio::select! {
                biased;
                _ = &mut iteration => {}
                _ = cancelled(&mut shutdown) => {
                    self.state.send_replace(VuState::Stopping);
                    iteration.await;
                }
            }
            iterations += 1;
            self.ctx.complete_iteration();

            if *shutdown.borrow() {
                break;
            }
            if self.think_time.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.think_time) => {}
                _ = cancelled(&mut shutdown) => break,
            }
        }

        self.state.send_replace(VuState::Stopping);
        tracing::debug!("Virtual user {} stopped after {iterations} iterations.", self.id);
        self.state.send_replace(VuState::Stopped);
        VuSummary {
            id: self.id,
            iterations,
        }
    }

    async fn iterate(&self, iteration: u64) {
        let started = Instant::now();
        let result = AssertUnwindSafe(async { (self.action)().await })
            .catch_unwind()
            .await;
        let at = self.collector.elapsed();

        let response = match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                tracing::debug!("Virtual user {} iteration {iteration} failed: {err}", self.id);
                Err(err.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!("Virtual user {} iteration {iteration} panicked: {message}", self.id);
                Err(format!("panic: {message}"))
            }
        };

        let mut samples = Vec::with_capacity(3 + self.checks.len());
        let outcome = match &response {
            Ok(r) => Outcome::from_success(self.classifier.classify(r)),
            Err(_) => Outcome::Failure,
        };
        let request = match &response {
            Ok(r) => self
                .sample(at, r.duration, outcome)
                .with_tag("status", r.status.to_string()),
            Err(message) => self
                .sample(at, started.elapsed(), outcome)
                .with_tag("error", message.clone()),
        };
        samples.push((HTTP_REQ_DURATION, request.clone()));
        samples.push((HTTP_REQ_FAILED, request));

        for check in &self.checks {
            // a call without a response fails every check
            let passed = response.as_ref().is_ok_and(|r| check.evaluate(r));
            samples.push((
                CHECKS,
                self.sample(at, Duration::ZERO, Outcome::from_success(passed))
                    .with_tag("check", check.name()),
            ));
        }

        samples.push((
            ITERATION_DURATION,
            self.sample(at, started.elapsed(), outcome),
        ));
        self.collector.record_batch(samples);
    }

    fn sample(&self, at: Duration, duration: Duration, outcome: Outcome) -> Sample {
        Sample::new(at, duration, outcome)
            .with_tag("scenario", self.name.as_str())
            .with_tag("vu", self.id.to_string())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
