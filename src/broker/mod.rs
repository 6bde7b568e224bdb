//! Broker-facing seams.
//!
//! The publisher and subscriber never talk to rdkafka directly; they own a
//! [`TransactionalProducer`] or an [`OffsetConsumer`]. The Kafka
//! implementations live in [`crate::kafka`], and [`memory`] provides an
//! in-process broker that models transactions, idempotent sends and
//! committed offsets for tests.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

use crate::config::{Config, GroupConfig};
use crate::dead_letter::DeadLetterContext;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// What the broker says about a send once it answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceStatus {
    /// Acknowledged by all in-sync replicas.
    Persisted,
    /// The broker may or may not have written it (e.g. ack lost in transit).
    PossiblyPersisted,
    NotPersisted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub partition: i32,
    pub offset: i64,
    pub status: PersistenceStatus,
}

/// A record pulled from the broker, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub tp: TopicPartition,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    Record(ConsumedRecord),
    /// The consumer caught up with the end of a partition.
    PartitionEof(TopicPartition),
}

/// A producer with idempotence and transactions enabled.
#[async_trait]
pub trait TransactionalProducer: Send {
    /// Registers the transactional id with the coordinator. Fails with
    /// [`Error::Timeout`](crate::Error::Timeout) when the coordinator does not
    /// answer in time.
    async fn init_transactions(&mut self, timeout: Duration) -> Result<()>;

    async fn begin_transaction(&mut self) -> Result<()>;

    /// Sends one record inside the open transaction and waits for the
    /// delivery report.
    async fn send(&mut self, topic: &str, key: &str, payload: &[u8]) -> Result<DeliveryReport>;

    async fn commit_transaction(&mut self, timeout: Duration) -> Result<()>;

    async fn abort_transaction(&mut self, timeout: Duration) -> Result<()>;

    async fn flush(&mut self, timeout: Duration) -> Result<()>;
}

/// A group consumer with manual offset store and manual commit.
#[async_trait]
pub trait OffsetConsumer: Send {
    /// Waits for the next record or end-of-partition marker.
    async fn poll(&mut self) -> Result<PollEvent>;

    /// Marks `offset` as processed; the next commit moves the group past it.
    fn store_offset(&mut self, tp: &TopicPartition, offset: i64) -> Result<()>;

    /// Synchronously commits every stored offset.
    fn commit(&mut self) -> Result<()>;

    /// Moves the read position of `tp` so that `offset` is delivered next.
    fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<()>;

    /// Leaves the group. Stored but uncommitted offsets are committed first.
    async fn close(&mut self) -> Result<()>;
}

/// Destination for records that ran out of retry attempts.
#[async_trait]
pub trait DeadLetterSink: Send {
    async fn route(&mut self, record: &ConsumedRecord, context: &DeadLetterContext) -> Result<()>;
}

/// Builds the broker connections the driver hands to each task.
pub trait BrokerClients: Send + Sync + 'static {
    type Producer: TransactionalProducer + 'static;
    type Consumer: OffsetConsumer + 'static;
    type DeadLetter: DeadLetterSink + 'static;

    fn producer(&self, config: &Config) -> Result<Self::Producer>;

    fn consumer(&self, config: &Config, group: &GroupConfig) -> Result<Self::Consumer>;

    fn dead_letter(&self, config: &Config, group: &GroupConfig) -> Result<Self::DeadLetter>;
}
