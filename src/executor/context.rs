use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use tokio::sync::watch::{Receiver, Sender, channel};

/// State shared by the scheduler and every virtual user of one run.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    /// Flips to `true` once, when the run should wind down.
    pub shutdown: Receiver<bool>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    /// Iterations recorded so far by all users, aborted ones included.
    completed: Arc<AtomicU64>,
    /// Iterations left across all users, `None` when only the duration bounds the run.
    budget: Option<Arc<AtomicU64>>,
}

impl ExecutionContext {
    pub fn new(iterations: Option<u64>) -> (Self, Sender<bool>) {
        let (tx, rx) = channel(false);
        (
            Self {
                shutdown: rx,
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
                completed: Arc::new(AtomicU64::new(0)),
                budget: iterations.map(|n| Arc::new(AtomicU64::new(n))),
            },
            tx,
        )
    }

    /// Takes one iteration from the shared budget. Always succeeds without a budget.
    pub fn claim_iteration(&self) -> bool {
        match &self.budget {
            None => true,
            Some(left) => left
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok(),
        }
    }

    /// Marks one more user as running until the guard is dropped, aborted tasks
    /// included.
    pub fn enter(&self) -> ActiveGuard {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        ActiveGuard {
            active: Arc::clone(&self.active),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn complete_iteration(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously running users seen so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Resolves once the shutdown flag is set, or the sender is gone.
pub(crate) async fn cancelled(shutdown: &mut Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_claimed_exactly() {
        let (ctx, _) = ExecutionContext::new(Some(3));
        let other = ctx.clone();
        assert!(ctx.claim_iteration());
        assert!(other.claim_iteration());
        assert!(ctx.claim_iteration());
        assert!(!other.claim_iteration());
        assert!(!ctx.claim_iteration());
    }

    #[test]
    fn no_budget_never_runs_out() {
        let (ctx, _) = ExecutionContext::new(None);
        assert!((0..10_000).all(|_| ctx.claim_iteration()));
    }

    #[test]
    fn guards_track_active_and_peak() {
        let (ctx, _) = ExecutionContext::new(None);
        let a = ctx.enter();
        let b = ctx.enter();
        assert_eq!(ctx.active(), 2);
        drop(a);
        let c = ctx.enter();
        assert_eq!(ctx.active(), 2);
        drop(b);
        drop(c);
        assert_eq!(ctx.active(), 0);
        assert_eq!(ctx.peak(), 2);
    }

    #[test]
    fn completed_iterations_are_shared() {
        let (ctx, _) = ExecutionContext::new(None);
        let other = ctx.clone();
        ctx.complete_iteration();
        other.complete_iteration();
        drop(other);
        assert_eq!(ctx.completed(), 2);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (mut ctx, tx) = ExecutionContext::new(None);
        tx.send_replace(true);
        tx.send_replace(true);
        cancelled(&mut ctx.shutdown).await;
        assert!(*ctx.shutdown.borrow());
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_cancelled() {
        let (mut ctx, tx) = ExecutionContext::new(None);
        drop(tx);
        cancelled(&mut ctx.shutdown).await;
    }
}
