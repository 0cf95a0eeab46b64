//! Panic-safe task spawning.
//!
//! The node loop and the p2p message handlers must never let a panicking
//! background task disappear silently — every spawn in this crate goes
//! through [`spawn_tracked`] so a panic becomes a `tracing::error!` instead of
//! a vanished task.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;

/// Coarse classification used only for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    NodeLoop,
    P2pHandler,
    Replenisher,
    InitiatorVoting,
    Background,
}

impl TaskType {
    fn label(&self) -> &'static str {
        match self {
            TaskType::NodeLoop => "node-loop",
            TaskType::P2pHandler => "p2p-handler",
            TaskType::Replenisher => "replenisher",
            TaskType::InitiatorVoting => "initiator-voting",
            TaskType::Background => "background",
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskTracker {
    spawned: AtomicU64,
    panicked: AtomicU64,
}

impl TaskTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }
}

/// Spawn `future` on the tokio runtime, catching panics and logging them with
/// the given `task_type` label instead of letting the `JoinHandle` carry a
/// `JoinError` nobody checks.
pub fn spawn_tracked<F>(task_type: TaskType, tracker: Arc<TaskTracker>, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracker.spawned.fetch_add(1, Ordering::Relaxed);
    let label = task_type.label();
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(future).catch_unwind().await {
            tracker.panicked.fetch_add(1, Ordering::Relaxed);
            let msg = panic_message(&panic);
            tracing::error!(task = label, panic = %msg, "background task panicked");
        }
    })
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panics_are_caught_and_counted() {
        let tracker = TaskTracker::new();
        let handle = spawn_tracked(TaskType::Background, tracker.clone(), async {
            panic!("boom");
        });
        let _ = handle.await;
        assert_eq!(tracker.panicked(), 1);
        assert_eq!(tracker.spawned(), 1);
    }

    #[tokio::test]
    async fn clean_completion_does_not_count_as_panic() {
        let tracker = TaskTracker::new();
        let handle = spawn_tracked(TaskType::NodeLoop, tracker.clone(), async {});
        handle.await.unwrap();
        assert_eq!(tracker.panicked(), 0);
    }
}
