//! In-memory doubles for the broker side, used by unit tests and the tests/ directory.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::claim::ClaimProcessor;
use crate::consumer_group::GroupClient;
use crate::error::ConsumeError;
use crate::session::ClaimSession;
use crate::types::{Partition, Record};

pub fn record(topic: &str, partition: i32, offset: i64, payload: &[u8]) -> Record {
    Record::new(
        Partition::new(topic, partition),
        offset,
        None,
        payload.to_vec(),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Mark(Partition, i64),
    Reset(Partition, i64),
}

/// Records every call a claim makes, in order, without interpreting them.
pub struct RecordingSession {
    calls: Mutex<Vec<SessionCall>>,
    last_mark_at: Mutex<Option<Instant>>,
    high_water_mark: i64,
    fail_high_water_mark: AtomicBool,
}

impl RecordingSession {
    pub fn new(high_water_mark: i64) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            last_mark_at: Mutex::new(None),
            high_water_mark,
            fail_high_water_mark: AtomicBool::new(false),
        }
    }

    pub fn fail_high_water_mark(&self) {
        self.fail_high_water_mark.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn marks(&self) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SessionCall::Mark(_, offset) => Some(offset),
                SessionCall::Reset(..) => None,
            })
            .collect()
    }

    pub fn resets(&self) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SessionCall::Reset(_, offset) => Some(offset),
                SessionCall::Mark(..) => None,
            })
            .collect()
    }

    pub fn last_mark_at(&self) -> Option<Instant> {
        *self.last_mark_at.lock().unwrap()
    }
}

#[async_trait]
impl ClaimSession for RecordingSession {
    fn mark_offset(&self, partition: &Partition, next_offset: i64) {
        self.calls
            .lock()
            .unwrap()
            .push(SessionCall::Mark(partition.clone(), next_offset));
        *self.last_mark_at.lock().unwrap() = Some(Instant::now());
    }

    fn reset_offset(&self, partition: &Partition, offset: i64) {
        self.calls
            .lock()
            .unwrap()
            .push(SessionCall::Reset(partition.clone(), offset));
    }

    async fn high_water_mark(&self, _partition: &Partition) -> Result<i64, ConsumeError> {
        if self.fail_high_water_mark.load(Ordering::SeqCst) {
            return Err(ConsumeError::Session("watermarks unavailable".to_string()));
        }
        Ok(self.high_water_mark)
    }
}

/// A single-partition log with a committed offset, standing in for a broker.
pub struct InMemoryBroker {
    partition: Partition,
    log: Mutex<Vec<Vec<u8>>>,
    committed: Mutex<i64>,
    commit_history: Mutex<Vec<i64>>,
    sessions: AtomicUsize,
    failures: AtomicUsize,
    closes: AtomicUsize,
}

impl InMemoryBroker {
    pub fn append(&self, payload: &[u8]) -> i64 {
        let mut log = self.log.lock().unwrap();
        log.push(payload.to_vec());
        log.len() as i64 - 1
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn committed(&self) -> i64 {
        *self.committed.lock().unwrap()
    }

    /// Every committed offset change, in order.
    pub fn commit_history(&self) -> Vec<i64> {
        self.commit_history.lock().unwrap().clone()
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn records_from(&self, offset: i64) -> Vec<Record> {
        let log = self.log.lock().unwrap();
        log.iter()
            .enumerate()
            .skip(offset.max(0) as usize)
            .map(|(index, payload)| {
                Record::new(self.partition.clone(), index as i64, None, payload.clone())
            })
            .collect()
    }

    fn set_committed(&self, offset: i64) {
        *self.committed.lock().unwrap() = offset;
        self.commit_history.lock().unwrap().push(offset);
    }
}

#[async_trait]
impl ClaimSession for InMemoryBroker {
    fn mark_offset(&self, partition: &Partition, next_offset: i64) {
        assert_eq!(partition, &self.partition);
        if next_offset > self.committed() {
            self.set_committed(next_offset);
        }
    }

    fn reset_offset(&self, partition: &Partition, offset: i64) {
        assert_eq!(partition, &self.partition);
        self.set_committed(offset);
    }

    async fn high_water_mark(&self, _partition: &Partition) -> Result<i64, ConsumeError> {
        Ok(self.log.lock().unwrap().len() as i64)
    }
}

/// [`GroupClient`] over an [`InMemoryBroker`]. Each session replays the log from the
/// committed offset, keeps the stream open until cancelled, and ends as soon as the claim
/// returns.
pub struct InMemoryGroupClient {
    broker: Arc<InMemoryBroker>,
}

impl InMemoryGroupClient {
    pub fn new(topic: &str) -> Self {
        Self {
            broker: Arc::new(InMemoryBroker {
                partition: Partition::new(topic, 0),
                log: Mutex::new(Vec::new()),
                committed: Mutex::new(0),
                commit_history: Mutex::new(Vec::new()),
                sessions: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn broker(&self) -> Arc<InMemoryBroker> {
        self.broker.clone()
    }

    /// The next `count` sessions fail immediately with a transient error.
    pub fn fail_next_sessions(&self, count: usize) {
        self.broker.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl GroupClient for InMemoryGroupClient {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        processor: &ClaimProcessor,
    ) -> Result<(), ConsumeError> {
        let broker = &self.broker;
        broker.sessions.fetch_add(1, Ordering::SeqCst);

        let failures = broker.failures.load(Ordering::SeqCst);
        if failures > 0 {
            broker.failures.store(failures - 1, Ordering::SeqCst);
            return Err(ConsumeError::Session("rebalance in progress".to_string()));
        }

        let records = broker.records_from(broker.committed());
        let (sender, mut receiver) = mpsc::channel(records.len().max(1));
        let session_cancel = cancel.child_token();
        let feeder_cancel = session_cancel.clone();
        let feeder = tokio::spawn(async move {
            for record in records {
                if sender.send(record).await.is_err() {
                    return;
                }
            }
            // Live stream: stays open until the session ends
            feeder_cancel.cancelled().await;
        });

        tokio::select! {
            _ = processor.process(broker.as_ref(), broker.partition(), &mut receiver) => {}
            _ = cancel.cancelled() => {}
        }

        session_cancel.cancel();
        drop(feeder.await);
        Ok(())
    }

    async fn close(&self) {
        self.broker.closes.fetch_add(1, Ordering::SeqCst);
    }
}
