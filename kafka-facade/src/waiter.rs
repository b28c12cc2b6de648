use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Tracks every consumer group lifecycle task started through a facade, so the process can
/// block until all of them have exited.
///
/// Created empty alongside the facade; clones share the same set of tasks.
#[derive(Clone, Default)]
pub struct Waiter {
    tracker: TaskTracker,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Number of lifecycle tasks still running.
    pub fn outstanding(&self) -> usize {
        self.tracker.len()
    }

    /// Resolves once every tracked task has finished. Returns immediately when nothing
    /// was started.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn wait_returns_immediately_when_empty() {
        let waiter = Waiter::new();
        tokio::time::timeout(Duration::from_secs(1), waiter.wait())
            .await
            .expect("empty waiter should not block");
    }

    #[tokio::test]
    async fn wait_blocks_until_tasks_finish() {
        let waiter = Waiter::new();
        let (tx, rx) = oneshot::channel::<()>();
        waiter.spawn(async move {
            drop(rx.await);
        });
        assert_eq!(waiter.outstanding(), 1);

        let pending = tokio::time::timeout(Duration::from_millis(50), waiter.wait()).await;
        assert!(pending.is_err());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter.clone().wait())
            .await
            .expect("waiter should finish after task exits");
        assert_eq!(waiter.outstanding(), 0);
    }
}
