use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::{Outcome, Record};

/// Business logic invoked for every record of a claimed partition, in partition order.
///
/// Returning [`Outcome::Accepted`] marks the record as consumed. What happens on
/// [`Outcome::Rejected`] depends on whether the group was built with a [`DeferredCommit`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, record: &Record) -> Outcome;
}

/// Asked to confirm a previously rejected record once its retry deadline passes.
#[async_trait]
pub trait CommitHandler: Send + Sync {
    async fn commit(&self, topic: &str) -> Outcome;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&Record) -> Outcome + Send + Sync,
{
    async fn handle(&self, record: &Record) -> Outcome {
        self(record)
    }
}

#[async_trait]
impl<F> CommitHandler for F
where
    F: Fn(&str) -> Outcome + Send + Sync,
{
    async fn commit(&self, topic: &str) -> Outcome {
        self(topic)
    }
}

/// Commit handler plus the interval between attempts.
#[derive(Clone)]
pub struct DeferredCommit {
    handler: Arc<dyn CommitHandler>,
    interval: Duration,
}

impl DeferredCommit {
    pub fn new(handler: impl CommitHandler + 'static, interval: Duration) -> Self {
        Self {
            handler: Arc::new(handler),
            interval,
        }
    }

    pub fn handler(&self) -> &dyn CommitHandler {
        self.handler.as_ref()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// A zero interval means retries are not configured.
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

impl std::fmt::Debug for DeferredCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredCommit")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
