//! Claim Processor - drives acknowledgement for one partition claim
//!
//! A claim runs from the moment a partition is handed to this consumer until the session
//! ends. It waits on four sources at once:
//! 1. the group's stop signal
//! 2. the offset override channel, until its sender is gone
//! 3. the deferred commit deadline, armed only while a rejected record is pending
//! 4. the next record of the partition
//!
//! Records keep flowing while a rejected record is pending. A later accepted record marks
//! an offset past the pending one, so it also clears the pending state.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ClaimError;
use crate::handler::{DeferredCommit, MessageHandler};
use crate::session::ClaimSession;
use crate::types::{Outcome, Partition, Record};

/// Receiving half of a group's offset override channel, shared by all of its claims.
pub type OverrideReceiver = Arc<Mutex<mpsc::Receiver<i64>>>;

/// Why a claim ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimEnd {
    /// The record stream was closed by the client (rebalance or session end)
    StreamClosed,
    /// The group or the session was stopped; any pending record was dropped
    Stopped,
    /// An override moved the partition backwards; the next session starts at `offset`
    Reset { offset: i64 },
}

#[derive(Debug)]
enum ClaimState {
    Idle,
    PendingCommit {
        topic: String,
        offset: i64,
        retry_at: Instant,
    },
}

impl ClaimState {
    fn retry_at(&self) -> Option<Instant> {
        match self {
            ClaimState::Idle => None,
            ClaimState::PendingCommit { retry_at, .. } => Some(*retry_at),
        }
    }
}

/// Everything a claim needs besides the session and the record stream. Cheap to clone,
/// one clone per claimed partition.
#[derive(Clone)]
pub struct ClaimProcessor {
    handler: Arc<dyn MessageHandler>,
    deferred: Option<DeferredCommit>,
    stop: CancellationToken,
    overrides: OverrideReceiver,
}

impl ClaimProcessor {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        deferred: Option<DeferredCommit>,
        stop: CancellationToken,
        overrides: OverrideReceiver,
    ) -> Self {
        let deferred = deferred.filter(DeferredCommit::is_enabled);
        Self {
            handler,
            deferred,
            stop,
            overrides,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// A clone for one session. Its claims stop when the group stops or when the returned
    /// token is cancelled.
    pub fn scoped(&self) -> (Self, CancellationToken) {
        let stop = self.stop.child_token();
        let processor = Self {
            stop: stop.clone(),
            ..self.clone()
        };
        (processor, stop)
    }

    /// Run the claim until the stream closes, the group stops, an override rewinds the
    /// partition, or a record is rejected without a deferred commit configured.
    pub async fn process<S>(
        &self,
        session: &S,
        partition: &Partition,
        records: &mut mpsc::Receiver<Record>,
    ) -> Result<ClaimEnd, ClaimError>
    where
        S: ClaimSession + ?Sized,
    {
        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "Starting claim"
        );

        let mut state = ClaimState::Idle;
        let mut overrides_open = true;

        loop {
            let retry_at = state.retry_at();

            tokio::select! {
                biased;

                _ = self.stop.cancelled() => {
                    if let ClaimState::PendingCommit { offset, .. } = &state {
                        debug!(
                            topic = partition.topic(),
                            partition = partition.partition_number(),
                            offset,
                            "Dropping pending commit on stop"
                        );
                    }
                    return Ok(ClaimEnd::Stopped);
                }

                requested = next_override(&self.overrides), if overrides_open => {
                    let Some(offset) = requested else {
                        // Handle dropped, the group keeps running without overrides
                        overrides_open = false;
                        continue;
                    };
                    let high_water_mark = session.high_water_mark(partition).await?;

                    if offset < high_water_mark {
                        info!(
                            topic = partition.topic(),
                            partition = partition.partition_number(),
                            offset,
                            high_water_mark,
                            "Resetting partition offset, ending session"
                        );
                        session.reset_offset(partition, offset);
                        return Ok(ClaimEnd::Reset { offset });
                    }

                    info!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        offset,
                        high_water_mark,
                        "Advancing committed offset"
                    );
                    session.mark_offset(partition, offset);
                    state = ClaimState::Idle;
                }

                _ = sleep_until(retry_at), if retry_at.is_some() => {
                    state = self.retry_commit(session, partition, state).await;
                }

                record = records.recv() => {
                    let Some(record) = record else {
                        debug!(
                            topic = partition.topic(),
                            partition = partition.partition_number(),
                            "Record stream closed"
                        );
                        return Ok(ClaimEnd::StreamClosed);
                    };
                    state = self.handle_record(session, partition, state, record).await?;
                }
            }
        }
    }

    async fn handle_record<S>(
        &self,
        session: &S,
        partition: &Partition,
        state: ClaimState,
        record: Record,
    ) -> Result<ClaimState, ClaimError>
    where
        S: ClaimSession + ?Sized,
    {
        match self.handler.handle(&record).await {
            Outcome::Accepted => {
                session.mark_offset(partition, record.offset() + 1);
                Ok(ClaimState::Idle)
            }
            Outcome::Rejected => {
                let Some(deferred) = &self.deferred else {
                    warn!(
                        topic = record.topic(),
                        partition = partition.partition_number(),
                        offset = record.offset(),
                        "Handler rejected record, ending claim"
                    );
                    return Err(ClaimError::FailToHandleMessage {
                        topic: record.topic().to_string(),
                        partition: partition.partition_number(),
                        offset: record.offset(),
                    });
                };

                if let ClaimState::PendingCommit { offset, .. } = &state {
                    debug!(
                        topic = record.topic(),
                        partition = partition.partition_number(),
                        replaced_offset = offset,
                        "Replacing pending commit"
                    );
                }
                debug!(
                    topic = record.topic(),
                    partition = partition.partition_number(),
                    offset = record.offset(),
                    retry_in_ms = deferred.interval().as_millis() as u64,
                    "Handler rejected record, deferring commit"
                );
                Ok(ClaimState::PendingCommit {
                    topic: record.topic().to_string(),
                    offset: record.offset(),
                    retry_at: Instant::now() + deferred.interval(),
                })
            }
        }
    }

    async fn retry_commit<S>(
        &self,
        session: &S,
        partition: &Partition,
        state: ClaimState,
    ) -> ClaimState
    where
        S: ClaimSession + ?Sized,
    {
        let (ClaimState::PendingCommit { topic, offset, .. }, Some(deferred)) =
            (&state, &self.deferred)
        else {
            return ClaimState::Idle;
        };

        match deferred.handler().commit(topic).await {
            Outcome::Accepted => {
                debug!(
                    topic = topic.as_str(),
                    partition = partition.partition_number(),
                    offset,
                    "Deferred commit succeeded"
                );
                session.mark_offset(partition, offset + 1);
                ClaimState::Idle
            }
            Outcome::Rejected => {
                debug!(
                    topic = topic.as_str(),
                    partition = partition.partition_number(),
                    offset,
                    "Deferred commit rejected, retrying later"
                );
                ClaimState::PendingCommit {
                    topic: topic.clone(),
                    offset: *offset,
                    retry_at: Instant::now() + deferred.interval(),
                }
            }
        }
    }
}

async fn next_override(overrides: &Mutex<mpsc::Receiver<i64>>) -> Option<i64> {
    overrides.lock().await.recv().await
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
