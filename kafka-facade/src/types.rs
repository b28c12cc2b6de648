use rdkafka::message::Message;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

/// A record delivered to a claim, detached from the client's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    partition: Partition,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

impl Record {
    pub fn new(partition: Partition, offset: i64, key: Option<Vec<u8>>, payload: Vec<u8>) -> Self {
        Self {
            partition,
            offset,
            key,
            payload,
        }
    }

    /// Copies topic, partition, offset, key and payload out of a client message.
    /// A missing payload becomes an empty one.
    pub fn from_message<M: Message>(message: &M) -> Self {
        Self {
            partition: Partition::new(message.topic(), message.partition()),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Result of handing a record (or a deferred commit) to caller code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected,
}

impl Outcome {
    pub fn is_accepted(self) -> bool {
        matches!(self, Outcome::Accepted)
    }
}

impl From<bool> for Outcome {
    fn from(accepted: bool) -> Self {
        if accepted {
            Outcome::Accepted
        } else {
            Outcome::Rejected
        }
    }
}

/// How many broker acknowledgements a produce call waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckLevel {
    /// Don't wait for the broker at all
    NoResponse,
    /// Wait for the partition leader to write the record
    #[default]
    WaitForLocal,
    /// Wait for every in-sync replica
    WaitForAll,
}

impl AckLevel {
    /// Value for the client's `acks` setting
    pub fn as_config_value(self) -> &'static str {
        match self {
            AckLevel::NoResponse => "0",
            AckLevel::WaitForLocal => "1",
            AckLevel::WaitForAll => "all",
        }
    }
}
