use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::claim::ClaimProcessor;
use crate::error::{ConsumeError, Error};
use crate::handler::{DeferredCommit, MessageHandler};
use crate::waiter::Waiter;

/// The group-membership side of a consumer group: joins the group, receives records
/// for the assigned partitions and runs one claim per partition.
#[async_trait]
pub trait GroupClient: Send + Sync + 'static {
    /// Run a single group session. Returns when the session ends (rebalance, a claim
    /// exiting, or `cancel` firing). Errors are treated as transient by the caller.
    async fn consume(
        &self,
        cancel: &CancellationToken,
        processor: &ClaimProcessor,
    ) -> Result<(), ConsumeError>;

    /// Release the connection. Called once, by the lifecycle task, after its last session.
    async fn close(&self) {}
}

/// Handle to a running consumer group.
///
/// Dropping the handle does not stop the group: it keeps consuming, without offset
/// overrides, until [`ConsumerGroup::stop`] is called or the parent token is cancelled.
pub struct ConsumerGroup {
    name: String,
    cancel: CancellationToken,
    stop: CancellationToken,
    overrides: mpsc::Sender<i64>,
}

impl ConsumerGroup {
    /// Start the lifecycle loop for `client` on the waiter. The loop re-enters
    /// [`GroupClient::consume`] after every session, pausing `retry_interval` in between,
    /// until the group is stopped or `parent` is cancelled.
    pub fn start<C: GroupClient>(
        name: impl Into<String>,
        client: C,
        handler: Arc<dyn MessageHandler>,
        deferred: Option<DeferredCommit>,
        retry_interval: Duration,
        waiter: &Waiter,
        parent: &CancellationToken,
    ) -> Self {
        let name = name.into();
        let cancel = parent.child_token();
        let stop = cancel.child_token();
        let (overrides, override_receiver) = mpsc::channel(1);

        let processor = ClaimProcessor::new(
            handler,
            deferred,
            stop.clone(),
            Arc::new(Mutex::new(override_receiver)),
        );

        let group = name.clone();
        let loop_cancel = cancel.clone();
        waiter.spawn(async move {
            run_lifecycle(group, client, processor, retry_interval, loop_cancel).await;
        });

        Self {
            name,
            cancel,
            stop,
            overrides,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the claims to move the committed offset. Waits while a previous override is
    /// still unread.
    pub async fn set_offset(&self, offset: i64) -> Result<(), Error> {
        self.overrides
            .send(offset)
            .await
            .map_err(|_| Error::GroupStopped)
    }

    /// Stop the lifecycle loop and every active claim. Pending deferred commits are dropped.
    pub fn stop(self) {
        info!(group = %self.name, "Stopping consumer group");
        self.cancel.cancel();
        self.stop.cancel();
        drop(self.overrides);
    }
}

async fn run_lifecycle<C: GroupClient>(
    group: String,
    client: C,
    processor: ClaimProcessor,
    retry_interval: Duration,
    cancel: CancellationToken,
) {
    info!(group = %group, "Consumer group started");

    loop {
        if let Err(e) = client.consume(&cancel, &processor).await {
            error!(group = %group, error = %e, "Error occurred on consume");
        }
        if cancel.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(retry_interval) => {}
        }
    }

    client.close().await;
    info!(group = %group, "Consumer group stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::InMemoryGroupClient;
    use crate::types::{Outcome, Record};

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_after_interval() {
        let client = InMemoryGroupClient::new("events");
        client.fail_next_sessions(2);
        let broker = client.broker();
        let waiter = Waiter::new();
        let root = CancellationToken::new();

        let group = ConsumerGroup::start(
            "group",
            client,
            Arc::new(|_: &Record| Outcome::Accepted),
            None,
            Duration::from_secs(1),
            &waiter,
            &root,
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(broker.sessions(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(broker.sessions(), 3);

        group.stop();
        waiter.wait().await;
        assert_eq!(broker.closes(), 1);
    }

    #[tokio::test]
    async fn dropped_handle_keeps_consuming() {
        let client = InMemoryGroupClient::new("events");
        let broker = client.broker();
        for _ in 0..3 {
            broker.append(b"payload");
        }
        let waiter = Waiter::new();
        let root = CancellationToken::new();

        let group = ConsumerGroup::start(
            "group",
            client,
            Arc::new(|_: &Record| Outcome::Accepted),
            None,
            Duration::from_millis(10),
            &waiter,
            &root,
        );
        drop(group);

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.committed() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("records were not consumed after the handle was dropped");
        assert_eq!(broker.sessions(), 1);

        root.cancel();
        tokio::time::timeout(Duration::from_secs(5), waiter.wait())
            .await
            .expect("lifecycle did not exit after cancellation");
    }

    #[tokio::test]
    async fn parent_cancellation_stops_group() {
        let client = InMemoryGroupClient::new("events");
        let broker = client.broker();
        let waiter = Waiter::new();
        let root = CancellationToken::new();

        let _group = ConsumerGroup::start(
            "group",
            client,
            Arc::new(|_: &Record| Outcome::Accepted),
            None,
            Duration::from_millis(10),
            &waiter,
            &root,
        );

        root.cancel();
        tokio::time::timeout(Duration::from_secs(5), waiter.wait())
            .await
            .expect("lifecycle did not exit after cancellation");
        assert_eq!(broker.closes(), 1);
    }
}
