//! rdkafka-backed [`GroupClient`].
//!
//! One `consume` call is one session. Every assigned partition gets its own claim task for
//! the whole session, idle or not, so offset overrides reach caught-up partitions too.
//! Records are read from a single `StreamConsumer` and routed to a bounded channel per
//! partition, so partitions run concurrently while every partition stays ordered.
//!
//! A session ends when partitions are revoked, when the first claim exits, or on
//! cancellation. The remaining claims are stopped rather than drained, and each partition
//! touched in the session is repositioned to the first record that was not acknowledged,
//! so records routed to a claim but never handled are read again by the next session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::claim::{ClaimEnd, ClaimProcessor};
use crate::consumer_group::GroupClient;
use crate::error::{ClaimError, ConsumeError, Error};
use crate::session::{ClaimSession, OffsetLedger};
use crate::types::{Partition, Record};

const CLAIM_BUFFER_SIZE: usize = 16;
const BROKER_TIMEOUT: Duration = Duration::from_secs(10);

/// Signals rebalances to the running session.
pub struct GroupContext {
    revocations: watch::Sender<u64>,
    assignments: watch::Sender<u64>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // Cooperative assignment sends empty revokes on every membership change
                if partitions.count() == 0 {
                    return;
                }
                info!(
                    partitions = partitions.count(),
                    "Partitions revoked, ending session"
                );
                self.revocations.send_modify(|generation| *generation += 1);
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    // The assignment is only visible through `assignment()` once applied
    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            info!(partitions = partitions.count(), "Partitions assigned");
            self.assignments.send_modify(|generation| *generation += 1);
        }
    }
}

/// First and last offset routed to a claim during one session.
#[derive(Debug, Clone, Copy)]
struct Routed {
    first: i64,
    last: i64,
}

/// Offset operations for claims, backed by the consumer's offset store.
struct KafkaSession {
    consumer: Arc<StreamConsumer<GroupContext>>,
    ledger: Arc<OffsetLedger>,
}

#[async_trait]
impl ClaimSession for KafkaSession {
    fn mark_offset(&self, partition: &Partition, next_offset: i64) {
        if !self.ledger.mark(partition, next_offset) {
            return;
        }
        if let Err(e) = store_offset(&self.consumer, partition, next_offset) {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                next_offset,
                error = %e,
                "Failed to store offset"
            );
        }
    }

    fn reset_offset(&self, partition: &Partition, offset: i64) {
        self.ledger.reset(partition, offset);
    }

    async fn high_water_mark(&self, partition: &Partition) -> Result<i64, ConsumeError> {
        let consumer = self.consumer.clone();
        let topic = partition.topic().to_string();
        let partition_number = partition.partition_number();

        let (_low, high) = tokio::task::spawn_blocking(move || {
            consumer.fetch_watermarks(&topic, partition_number, BROKER_TIMEOUT)
        })
        .await
        .map_err(|e| ConsumeError::Session(format!("watermark lookup failed: {e}")))??;

        Ok(high)
    }
}

fn store_offset(
    consumer: &StreamConsumer<GroupContext>,
    partition: &Partition,
    next_offset: i64,
) -> Result<(), KafkaError> {
    let mut list = TopicPartitionList::new();
    list.add_partition_offset(
        partition.topic(),
        partition.partition_number(),
        Offset::Offset(next_offset),
    )?;
    consumer.store_offsets(&list)
}

type ClaimSet = JoinSet<(Partition, Result<ClaimEnd, ClaimError>)>;

pub struct KafkaGroupClient {
    group: String,
    consumer: Arc<StreamConsumer<GroupContext>>,
    revocations: watch::Sender<u64>,
    assignments: watch::Sender<u64>,
    ledger: Arc<OffsetLedger>,
}

impl KafkaGroupClient {
    /// Open the group client and subscribe to `topics`. Offsets are stored by the claims
    /// and committed in the background.
    pub async fn connect(
        mut client_config: ClientConfig,
        group: &str,
        topics: &[&str],
        skip_unread: bool,
    ) -> Result<Self, Error> {
        client_config
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set(
                "auto.offset.reset",
                if skip_unread { "latest" } else { "earliest" },
            );

        let (revocations, _) = watch::channel(0);
        let (assignments, _) = watch::channel(0);
        let context = GroupContext {
            revocations: revocations.clone(),
            assignments: assignments.clone(),
        };

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: Arc<StreamConsumer<GroupContext>> =
            Arc::new(client_config.create_with_context(context)?);

        // "Ping" the brokers so bad addresses or credentials fail here
        let ping = consumer.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            ping.fetch_metadata(None, BROKER_TIMEOUT)
                .map(|metadata| metadata.topics().len())
        })
        .await?;
        match metadata {
            Ok(topics) => {
                info!(group, topics, "Connected to Kafka brokers");
            }
            Err(error) => {
                error!(group, "Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error.into());
            }
        }

        consumer.subscribe(topics)?;

        Ok(Self {
            group: group.to_string(),
            consumer,
            revocations,
            assignments,
            ledger: Arc::new(OffsetLedger::new()),
        })
    }

    async fn receive(&self) -> Result<Record, KafkaError> {
        self.consumer
            .recv()
            .await
            .map(|message| Record::from_message(&message))
    }

    fn spawn_claim(
        &self,
        claims: &mut ClaimSet,
        session: &Arc<KafkaSession>,
        processor: &ClaimProcessor,
        partition: Partition,
    ) -> mpsc::Sender<Record> {
        let (sender, mut receiver) = mpsc::channel(CLAIM_BUFFER_SIZE);
        let session = session.clone();
        let processor = processor.clone();

        claims.spawn(async move {
            let result = processor
                .process(session.as_ref(), &partition, &mut receiver)
                .await;
            (partition, result)
        });

        sender
    }

    /// Start a claim for every assigned partition that doesn't have one yet.
    fn claim_assigned(
        &self,
        senders: &mut HashMap<Partition, mpsc::Sender<Record>>,
        claims: &mut ClaimSet,
        session: &Arc<KafkaSession>,
        processor: &ClaimProcessor,
    ) {
        let assignment = match self.consumer.assignment() {
            Ok(assignment) => assignment,
            Err(e) => {
                warn!(group = %self.group, error = %e, "Failed to read partition assignment");
                return;
            }
        };

        for element in assignment.elements() {
            let partition = Partition::new(element.topic(), element.partition());
            senders.entry(partition).or_insert_with_key(|partition| {
                self.spawn_claim(claims, session, processor, partition.clone())
            });
        }
    }

    /// Commit stored offsets, apply resets, and seek every routed partition back to its
    /// first unacknowledged record.
    fn finish_session(&self, routed: HashMap<Partition, Routed>) {
        let rewinds: HashMap<Partition, i64> = self.ledger.take_rewinds().into_iter().collect();

        for (partition, offset) in &rewinds {
            let committed = store_offset(&self.consumer, partition, *offset).and_then(|_| {
                let mut list = TopicPartitionList::new();
                list.add_partition_offset(
                    partition.topic(),
                    partition.partition_number(),
                    Offset::Offset(*offset),
                )?;
                self.consumer.commit(&list, CommitMode::Sync)
            });
            match committed {
                Ok(()) => info!(
                    group = %self.group,
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset,
                    "Committed offset reset"
                ),
                Err(e) => error!(
                    group = %self.group,
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset,
                    error = %e,
                    "Failed to commit offset reset"
                ),
            }
        }

        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            debug!(group = %self.group, error = %e, "Nothing committed at session end");
        }

        for (partition, span) in routed {
            if rewinds.contains_key(&partition) {
                continue;
            }
            let resume = self
                .ledger
                .marked(&partition)
                .unwrap_or(span.first)
                .clamp(span.first, span.last + 1);
            if resume == span.last + 1 {
                continue;
            }

            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                resume,
                "Repositioning partition for next session"
            );
            if let Err(e) = self.consumer.seek(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(resume),
                BROKER_TIMEOUT,
            ) {
                // Revoked partitions can't be sought; the new owner starts from the committed offset
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    error = %e,
                    "Failed to reposition partition"
                );
            }
        }

        for (partition, offset) in rewinds {
            if let Err(e) = self.consumer.seek(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(offset),
                BROKER_TIMEOUT,
            ) {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    error = %e,
                    "Failed to reposition reset partition"
                );
            }
        }
    }
}

#[async_trait]
impl GroupClient for KafkaGroupClient {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        processor: &ClaimProcessor,
    ) -> Result<(), ConsumeError> {
        let session = Arc::new(KafkaSession {
            consumer: self.consumer.clone(),
            ledger: self.ledger.clone(),
        });
        let (processor, session_stop) = processor.scoped();
        let mut revocations = self.revocations.subscribe();
        revocations.borrow_and_update();
        let mut assignments = self.assignments.subscribe();
        assignments.borrow_and_update();

        let mut senders: HashMap<Partition, mpsc::Sender<Record>> = HashMap::new();
        let mut routed: HashMap<Partition, Routed> = HashMap::new();
        let mut claims = JoinSet::new();

        self.claim_assigned(&mut senders, &mut claims, &session, &processor);
        debug!(group = %self.group, claims = claims.len(), "Session started");

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),

                _ = revocations.changed() => break Ok(()),

                _ = assignments.changed() => {
                    self.claim_assigned(&mut senders, &mut claims, &session, &processor);
                }

                Some(joined) = claims.join_next() => {
                    log_claim_exit(&self.group, joined);
                    break Ok(());
                }

                received = self.receive() => {
                    let record = match received {
                        Ok(record) => record,
                        Err(e) => break Err(ConsumeError::Kafka(e)),
                    };
                    let partition = record.partition().clone();
                    let offset = record.offset();

                    // Tracked before the send so a record the claim never sees is re-read
                    routed
                        .entry(partition.clone())
                        .and_modify(|span| span.last = offset)
                        .or_insert(Routed {
                            first: offset,
                            last: offset,
                        });

                    let sender = senders
                        .entry(partition.clone())
                        .or_insert_with(|| {
                            self.spawn_claim(&mut claims, &session, &processor, partition)
                        })
                        .clone();

                    tokio::select! {
                        // A failed send means the claim already exited; join_next picks it up
                        _ = sender.send(record) => {}
                        _ = cancel.cancelled() => break Ok(()),
                        _ = revocations.changed() => break Ok(()),
                    }
                }
            }
        };

        // Partitions may already belong to another member, so nothing more is handled
        session_stop.cancel();
        drop(senders);
        while let Some(joined) = claims.join_next().await {
            log_claim_exit(&self.group, joined);
        }

        self.finish_session(routed);
        debug!(group = %self.group, "Session ended");
        result
    }

    async fn close(&self) {
        self.consumer.unsubscribe();
        info!(group = %self.group, "Closed consumer group client");
    }
}

fn log_claim_exit(
    group: &str,
    joined: Result<(Partition, Result<ClaimEnd, ClaimError>), tokio::task::JoinError>,
) {
    match joined {
        Ok((partition, Ok(end))) => debug!(
            group,
            topic = partition.topic(),
            partition = partition.partition_number(),
            end = ?end,
            "Claim ended"
        ),
        Ok((partition, Err(e))) => error!(
            group,
            topic = partition.topic(),
            partition = partition.partition_number(),
            error = %e,
            "Claim failed"
        ),
        Err(e) => error!(group, error = %e, "Claim task panicked"),
    }
}
