//! Offset bookkeeping shared between the claims of one consumer group.
//!
//! A claim never talks to the broker directly; it reports progress through a
//! [`ClaimSession`]. The rdkafka-backed session keeps an [`OffsetLedger`] so that marks
//! stay monotonic per partition and explicit resets can be applied when the session ends.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::error::ConsumeError;
use crate::types::Partition;

/// The group-coordinator side of a claim.
///
/// Offsets passed here are always the *next* offset to consume, so acknowledging the record
/// at offset `n` marks `n + 1`.
#[async_trait]
pub trait ClaimSession: Send + Sync {
    /// Record progress. Marks lower than the current mark are ignored.
    fn mark_offset(&self, partition: &Partition, next_offset: i64);

    /// Move the committed position to `offset`, even backwards. Takes effect for the next
    /// session on this partition.
    fn reset_offset(&self, partition: &Partition, offset: i64);

    /// Highest offset currently available on the partition.
    async fn high_water_mark(&self, partition: &Partition) -> Result<i64, ConsumeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PartitionOffsets {
    marked: i64,
    rewound: bool,
}

/// Per-partition marked offsets for the lifetime of a consumer group.
#[derive(Default)]
pub struct OffsetLedger {
    partitions: DashMap<Partition, PartitionOffsets>,
}

impl OffsetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the mark advanced the partition.
    pub fn mark(&self, partition: &Partition, next_offset: i64) -> bool {
        let mut advanced = false;
        self.partitions
            .entry(partition.clone())
            .and_modify(|state| {
                if next_offset > state.marked {
                    state.marked = next_offset;
                    advanced = true;
                }
            })
            .or_insert_with(|| {
                advanced = true;
                PartitionOffsets {
                    marked: next_offset,
                    rewound: false,
                }
            });

        if !advanced {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                next_offset,
                "Ignoring mark below current position"
            );
        }
        advanced
    }

    pub fn reset(&self, partition: &Partition, offset: i64) {
        self.partitions.insert(
            partition.clone(),
            PartitionOffsets {
                marked: offset,
                rewound: true,
            },
        );
    }

    pub fn marked(&self, partition: &Partition) -> Option<i64> {
        self.partitions.get(partition).map(|state| state.marked)
    }

    /// Drains pending resets, returning the offset each partition must be rewound to.
    pub fn take_rewinds(&self) -> Vec<(Partition, i64)> {
        let mut rewinds = Vec::new();
        for mut entry in self.partitions.iter_mut() {
            if entry.rewound {
                entry.rewound = false;
                rewinds.push((entry.key().clone(), entry.marked));
            }
        }
        rewinds
    }
}
