//! In-process broker used by tests and offline runs.
//!
//! The model follows the parts of Kafka the pipeline relies on:
//!
//! - records sent inside a transaction are appended to the log immediately but
//!   stay invisible to `read_committed` consumers until the transaction
//!   commits; aborted records are skipped, and an open transaction blocks
//!   `read_committed` readers at its first record (the last stable offset);
//! - every producer gets a producer id and a per-partition sequence, and the
//!   broker drops a batch whose sequence it already has;
//! - initializing a transactional id again bumps its epoch, aborts whatever
//!   the previous holder left open and fences that holder;
//! - committed offsets are kept per (group, partition) and survive consumers.
//!
//! Faults can be injected for each of these paths.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use super::{
    BrokerClients, ConsumedRecord, DeadLetterSink, DeliveryReport, OffsetConsumer,
    PersistenceStatus, PollEvent, TopicPartition, TransactionalProducer,
};
use crate::config::{Config, GroupConfig, IsolationLevel, StartPolicy};
use crate::dead_letter::{DeadLetterContext, DLQ_METADATA_HEADER};
use crate::{Error, Result};

/// Injected behaviour for the next send of any producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFault {
    /// The record is written but the report says it was not persisted.
    NotPersisted,
    /// The record is written but the acknowledgement never arrives.
    LostAcknowledgement,
    /// The client retransmits the batch; the broker sees it twice.
    NetworkDuplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnStatus {
    Open,
    Committed,
    Aborted,
}

/// A record as it sits in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Bytes,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl BrokerRecord {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_slice())
    }
}

#[derive(Debug, Clone)]
struct LogEntry {
    record: BrokerRecord,
    txn: Option<u64>,
}

#[derive(Debug, Default)]
struct TransactionalSlot {
    epoch: u32,
    open: Option<u64>,
}

#[derive(Debug, Default)]
struct Faults {
    init_timeouts: u32,
    sends: VecDeque<SendFault>,
    commits: u32,
    dead_letters: u32,
    polls: HashMap<String, u32>,
    offset_commits: HashMap<String, u32>,
    seeks: HashMap<String, u32>,
}

#[derive(Debug)]
struct BrokerState {
    partitions: i32,
    topics: HashMap<String, Vec<Vec<LogEntry>>>,
    transactional_ids: HashMap<String, TransactionalSlot>,
    transactions: HashMap<u64, TxnStatus>,
    next_txn: u64,
    next_producer_id: u64,
    sequences: HashMap<(u64, TopicPartition), HashMap<u64, i64>>,
    committed: HashMap<(String, TopicPartition), i64>,
    closed_consumers: HashMap<String, u32>,
    faults: Faults,
}

impl BrokerState {
    fn partitions_mut(&mut self, topic: &str) -> &mut Vec<Vec<LogEntry>> {
        let count = self.partitions;
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| (0..count).map(|_| Vec::new()).collect())
    }

    fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as i32
    }

    fn append(
        &mut self,
        topic: &str,
        partition: i32,
        key: Option<&str>,
        payload: &[u8],
        headers: Vec<(String, Vec<u8>)>,
        txn: Option<u64>,
    ) -> i64 {
        let log = &mut self.partitions_mut(topic)[partition as usize];
        let offset = log.len() as i64;
        log.push(LogEntry {
            record: BrokerRecord {
                partition,
                offset,
                key: key.map(str::to_string),
                payload: Bytes::copy_from_slice(payload),
                headers,
            },
            txn,
        });
        offset
    }

    fn status(&self, txn: Option<u64>) -> TxnStatus {
        match txn {
            None => TxnStatus::Committed,
            Some(id) => self
                .transactions
                .get(&id)
                .copied()
                .unwrap_or(TxnStatus::Aborted),
        }
    }

    fn log_end(&mut self, tp: &TopicPartition) -> i64 {
        self.partitions_mut(&tp.topic)
            .get(tp.partition as usize)
            .map(|log| log.len() as i64)
            .unwrap_or(0)
    }
}

struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// Cheaply cloneable handle to one in-process broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState {
                    partitions: partitions.max(1),
                    topics: HashMap::new(),
                    transactional_ids: HashMap::new(),
                    transactions: HashMap::new(),
                    next_txn: 1,
                    next_producer_id: 1,
                    sequences: HashMap::new(),
                    committed: HashMap::new(),
                    closed_consumers: HashMap::new(),
                    faults: Faults::default(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // Tolerate poisoning left by a panicked test thread
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wake(&self) {
        self.inner.notify.notify_waiters();
    }

    pub fn producer(&self, transactional_id: impl Into<String>) -> MemoryProducer {
        let producer_id = {
            let mut state = self.lock();
            let id = state.next_producer_id;
            state.next_producer_id += 1;
            id
        };
        MemoryProducer {
            broker: self.clone(),
            transactional_id: transactional_id.into(),
            producer_id,
            epoch: None,
            open_txn: None,
            next_sequence: HashMap::new(),
        }
    }

    /// Joins `group` and takes every partition of `topic`.
    ///
    /// Partitions without a committed offset start at the beginning of the
    /// log or at its current end, per the group's start policy.
    pub fn consumer(&self, group: &GroupConfig, topic: &str) -> MemoryConsumer {
        let mut state = self.lock();
        let partitions = state.partitions_mut(topic).len() as i32;
        let mut positions = HashMap::new();
        for partition in 0..partitions {
            let tp = TopicPartition::new(topic, partition);
            let start = match state.committed.get(&(group.id.clone(), tp.clone())).copied() {
                Some(offset) => offset,
                None => match group.start {
                    StartPolicy::Earliest => 0,
                    StartPolicy::Latest => state.log_end(&tp),
                },
            };
            positions.insert(partition, start);
        }

        MemoryConsumer {
            broker: self.clone(),
            group: group.id.clone(),
            isolation: group.isolation,
            topic: topic.to_string(),
            partitions,
            positions,
            stored: HashMap::new(),
            eof_reported: HashSet::new(),
            cursor: 0,
            closed: false,
        }
    }

    pub fn dead_letter_sink(&self, topic: impl Into<String>) -> MemoryDeadLetterSink {
        MemoryDeadLetterSink {
            broker: self.clone(),
            topic: topic.into(),
        }
    }

    /// The next `count` calls to `init_transactions` time out.
    pub fn fail_next_inits(&self, count: u32) {
        self.lock().faults.init_timeouts += count;
    }

    pub fn inject_send_fault(&self, fault: SendFault) {
        self.lock().faults.sends.push_back(fault);
    }

    pub fn fail_next_transaction_commits(&self, count: u32) {
        self.lock().faults.commits += count;
    }

    pub fn fail_next_dead_letters(&self, count: u32) {
        self.lock().faults.dead_letters += count;
    }

    pub fn fail_next_polls(&self, group: &str, count: u32) {
        *self
            .lock()
            .faults
            .polls
            .entry(group.to_string())
            .or_insert(0) += count;
    }

    pub fn fail_next_offset_commits(&self, group: &str, count: u32) {
        *self
            .lock()
            .faults
            .offset_commits
            .entry(group.to_string())
            .or_insert(0) += count;
    }

    pub fn fail_next_seeks(&self, group: &str, count: u32) {
        *self
            .lock()
            .faults
            .seeks
            .entry(group.to_string())
            .or_insert(0) += count;
    }

    /// Appends a record outside of any transaction.
    pub fn append_plain(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> (i32, i64) {
        let result = {
            let mut state = self.lock();
            let partition = key.map(|k| state.partition_for(k)).unwrap_or(0);
            let offset = state.append(topic, partition, key, payload, Vec::new(), None);
            (partition, offset)
        };
        self.wake();
        result
    }

    /// Records a `read_committed` (or `read_uncommitted`) reader would see,
    /// across all partitions, in partition then offset order.
    pub fn visible_records(&self, topic: &str, isolation: IsolationLevel) -> Vec<BrokerRecord> {
        let state = self.lock();
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };

        let mut visible = Vec::new();
        for log in partitions {
            for entry in log {
                match (isolation, state.status(entry.txn)) {
                    (IsolationLevel::ReadUncommitted, _) => visible.push(entry.record.clone()),
                    (IsolationLevel::ReadCommitted, TxnStatus::Committed) => {
                        visible.push(entry.record.clone())
                    }
                    (IsolationLevel::ReadCommitted, TxnStatus::Aborted) => {}
                    (IsolationLevel::ReadCommitted, TxnStatus::Open) => break,
                }
            }
        }
        visible
    }

    /// Physical number of records in the log, aborted ones included.
    pub fn log_len(&self, topic: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Next offset `group` will read from `tp` after a restart.
    pub fn committed_offset(&self, group: &str, tp: &TopicPartition) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), tp.clone()))
            .copied()
    }

    pub fn closed_consumers(&self, group: &str) -> u32 {
        self.lock()
            .closed_consumers
            .get(group)
            .copied()
            .unwrap_or(0)
    }

    pub fn open_transactions(&self) -> usize {
        self.lock()
            .transactions
            .values()
            .filter(|status| **status == TxnStatus::Open)
            .count()
    }
}

impl BrokerClients for InMemoryBroker {
    type Producer = MemoryProducer;
    type Consumer = MemoryConsumer;
    type DeadLetter = MemoryDeadLetterSink;

    fn producer(&self, config: &Config) -> Result<Self::Producer> {
        Ok(InMemoryBroker::producer(
            self,
            config.publisher.transactional_id.clone(),
        ))
    }

    fn consumer(&self, config: &Config, group: &GroupConfig) -> Result<Self::Consumer> {
        Ok(InMemoryBroker::consumer(self, group, &config.broker.topic))
    }

    fn dead_letter(&self, config: &Config, _group: &GroupConfig) -> Result<Self::DeadLetter> {
        Ok(self.dead_letter_sink(config.dead_letter_topic()))
    }
}

pub struct MemoryProducer {
    broker: InMemoryBroker,
    transactional_id: String,
    producer_id: u64,
    epoch: Option<u32>,
    open_txn: Option<u64>,
    next_sequence: HashMap<TopicPartition, u64>,
}

impl MemoryProducer {
    fn check_epoch(&self, state: &BrokerState) -> Result<u32> {
        let epoch = self.epoch.ok_or_else(|| Error::InvalidState {
            message: "transactions were not initialized".to_string(),
        })?;
        let current = state
            .transactional_ids
            .get(&self.transactional_id)
            .map(|slot| slot.epoch)
            .unwrap_or(0);
        if current != epoch {
            return Err(Error::Fenced {
                message: format!(
                    "transactional id '{}' moved to epoch {} (ours is {})",
                    self.transactional_id, current, epoch
                ),
            });
        }
        Ok(epoch)
    }

    fn open_txn(&self) -> Result<u64> {
        self.open_txn.ok_or_else(|| Error::InvalidState {
            message: "no transaction in progress".to_string(),
        })
    }

    fn finish(&mut self, outcome: TxnStatus) -> Result<()> {
        let txn = self.open_txn()?;
        {
            let mut state = self.broker.lock();
            self.check_epoch(&state)?;
            state.transactions.insert(txn, outcome);
            if let Some(slot) = state.transactional_ids.get_mut(&self.transactional_id) {
                slot.open = None;
            }
        }
        self.open_txn = None;
        self.broker.wake();
        Ok(())
    }
}

#[async_trait]
impl TransactionalProducer for MemoryProducer {
    async fn init_transactions(&mut self, timeout: Duration) -> Result<()> {
        {
            let mut state = self.broker.lock();
            if state.faults.init_timeouts > 0 {
                state.faults.init_timeouts -= 1;
                return Err(Error::Timeout {
                    message: format!(
                        "transaction coordinator did not answer within {:?}",
                        timeout
                    ),
                });
            }

            let slot = state
                .transactional_ids
                .entry(self.transactional_id.clone())
                .or_default();
            slot.epoch += 1;
            let epoch = slot.epoch;
            let zombie = slot.open.take();
            if let Some(txn) = zombie {
                debug!(txn, "Aborting transaction left open by a fenced producer");
                state.transactions.insert(txn, TxnStatus::Aborted);
            }
            self.epoch = Some(epoch);
        }
        self.broker.wake();
        Ok(())
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        if self.open_txn.is_some() {
            return Err(Error::InvalidState {
                message: "transaction already in progress".to_string(),
            });
        }

        let mut state = self.broker.lock();
        self.check_epoch(&state)?;
        let txn = state.next_txn;
        state.next_txn += 1;
        state.transactions.insert(txn, TxnStatus::Open);
        if let Some(slot) = state.transactional_ids.get_mut(&self.transactional_id) {
            slot.open = Some(txn);
        }
        self.open_txn = Some(txn);
        Ok(())
    }

    async fn send(&mut self, topic: &str, key: &str, payload: &[u8]) -> Result<DeliveryReport> {
        let txn = self.open_txn()?;
        let report = {
            let mut state = self.broker.lock();
            self.check_epoch(&state)?;

            let partition = state.partition_for(key);
            let tp = TopicPartition::new(topic, partition);
            let sequence = {
                let next = self.next_sequence.entry(tp.clone()).or_insert(0);
                let sequence = *next;
                *next += 1;
                sequence
            };
            let fault = state.faults.sends.pop_front();
            let transmissions = if fault == Some(SendFault::NetworkDuplicate) {
                2
            } else {
                1
            };

            let mut offset = -1;
            for _ in 0..transmissions {
                let seen = state
                    .sequences
                    .get(&(self.producer_id, tp.clone()))
                    .and_then(|batches| batches.get(&sequence))
                    .copied();
                offset = match seen {
                    Some(existing) => {
                        debug!(sequence, existing, "Dropping duplicate batch");
                        existing
                    }
                    None => {
                        let written =
                            state.append(topic, partition, Some(key), payload, Vec::new(), Some(txn));
                        state
                            .sequences
                            .entry((self.producer_id, tp.clone()))
                            .or_default()
                            .insert(sequence, written);
                        written
                    }
                };
            }

            match fault {
                Some(SendFault::LostAcknowledgement) => Err(Error::Timeout {
                    message: format!("no acknowledgement for {} offset {}", tp, offset),
                }),
                Some(SendFault::NotPersisted) => Ok(DeliveryReport {
                    partition,
                    offset,
                    status: PersistenceStatus::NotPersisted,
                }),
                _ => Ok(DeliveryReport {
                    partition,
                    offset,
                    status: PersistenceStatus::Persisted,
                }),
            }
        };
        self.broker.wake();
        report
    }

    async fn commit_transaction(&mut self, _timeout: Duration) -> Result<()> {
        {
            let mut state = self.broker.lock();
            if state.faults.commits > 0 {
                state.faults.commits -= 1;
                return Err(Error::Transaction {
                    message: "commit rejected by transaction coordinator".to_string(),
                });
            }
        }
        self.finish(TxnStatus::Committed)
    }

    async fn abort_transaction(&mut self, _timeout: Duration) -> Result<()> {
        self.finish(TxnStatus::Aborted)
    }

    async fn flush(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryConsumer {
    broker: InMemoryBroker,
    group: String,
    isolation: IsolationLevel,
    topic: String,
    partitions: i32,
    positions: HashMap<i32, i64>,
    stored: HashMap<i32, i64>,
    eof_reported: HashSet<i32>,
    cursor: i32,
    closed: bool,
}

impl MemoryConsumer {
    fn try_next(&mut self) -> Result<Option<PollEvent>> {
        if self.closed {
            return Err(Error::InvalidState {
                message: format!("consumer for group '{}' is closed", self.group),
            });
        }

        let mut state = self.broker.lock();
        if let Some(remaining) = state.faults.polls.get_mut(&self.group) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Connection(format!(
                    "broker connection lost while polling for group '{}'",
                    self.group
                )));
            }
        }

        for step in 0..self.partitions {
            let partition = (self.cursor + step) % self.partitions;
            let log_len = state.partitions_mut(&self.topic)[partition as usize].len() as i64;
            let mut position = self.positions.get(&partition).copied().unwrap_or(0);
            let mut found = None;

            while position < log_len {
                let entry = state.partitions_mut(&self.topic)[partition as usize]
                    [position as usize]
                    .clone();
                match (self.isolation, state.status(entry.txn)) {
                    (IsolationLevel::ReadCommitted, TxnStatus::Open) => break,
                    (IsolationLevel::ReadCommitted, TxnStatus::Aborted) => position += 1,
                    _ => {
                        found = Some(entry.record);
                        break;
                    }
                }
            }
            self.positions.insert(partition, position);

            if let Some(record) = found {
                self.positions.insert(partition, record.offset + 1);
                self.eof_reported.remove(&partition);
                self.cursor = (partition + 1) % self.partitions;
                return Ok(Some(PollEvent::Record(ConsumedRecord {
                    tp: TopicPartition::new(self.topic.clone(), partition),
                    offset: record.offset,
                    key: record.key,
                    payload: record.payload,
                })));
            }

            if position >= log_len && self.eof_reported.insert(partition) {
                return Ok(Some(PollEvent::PartitionEof(TopicPartition::new(
                    self.topic.clone(),
                    partition,
                ))));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl OffsetConsumer for MemoryConsumer {
    async fn poll(&mut self) -> Result<PollEvent> {
        let inner = Arc::clone(&self.broker.inner);
        loop {
            // Registered before looking at the log so no append can slip by
            let notified = inner.notify.notified();
            if let Some(event) = self.try_next()? {
                return Ok(event);
            }
            notified.await;
        }
    }

    fn store_offset(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        if tp.topic != self.topic || tp.partition >= self.partitions {
            return Err(Error::InvalidState {
                message: format!("{} is not assigned to group '{}'", tp, self.group),
            });
        }
        self.stored.insert(tp.partition, offset + 1);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let mut state = self.broker.lock();
        if let Some(remaining) = state.faults.offset_commits.get_mut(&self.group) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Connection(format!(
                    "offset commit for group '{}' failed",
                    self.group
                )));
            }
        }

        for (partition, offset) in self.stored.drain() {
            let tp = TopicPartition::new(self.topic.clone(), partition);
            state.committed.insert((self.group.clone(), tp), offset);
        }
        Ok(())
    }

    fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        if tp.topic != self.topic || tp.partition >= self.partitions {
            return Err(Error::InvalidState {
                message: format!("cannot seek unassigned {}", tp),
            });
        }
        if let Some(remaining) = self.broker.lock().faults.seeks.get_mut(&self.group) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Connection(format!(
                    "seek on {} failed for group '{}'",
                    tp, self.group
                )));
            }
        }
        self.positions.insert(tp.partition, offset);
        self.eof_reported.remove(&tp.partition);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let flushed = if self.stored.is_empty() {
            Ok(())
        } else {
            self.commit()
        };
        self.closed = true;
        *self
            .broker
            .lock()
            .closed_consumers
            .entry(self.group.clone())
            .or_insert(0) += 1;
        flushed
    }
}

pub struct MemoryDeadLetterSink {
    broker: InMemoryBroker,
    topic: String,
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn route(&mut self, record: &ConsumedRecord, context: &DeadLetterContext) -> Result<()> {
        let header = context.to_header_value()?;
        {
            let mut state = self.broker.lock();
            if state.faults.dead_letters > 0 {
                state.faults.dead_letters -= 1;
                return Err(Error::DeadLetter {
                    message: format!("{} rejected the record", self.topic),
                });
            }
            state.append(
                &self.topic,
                0,
                record.key.as_deref(),
                &record.payload,
                vec![(DLQ_METADATA_HEADER.to_string(), header)],
                None,
            );
        }
        self.broker.wake();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "courses";

    async fn send_committed(producer: &mut MemoryProducer, key: &str, payload: &[u8]) {
        producer.begin_transaction().await.unwrap();
        producer.send(TOPIC, key, payload).await.unwrap();
        producer
            .commit_transaction(Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_transaction_blocks_read_committed() {
        let broker = InMemoryBroker::new();
        let mut producer = broker.producer("tx");
        producer
            .init_transactions(Duration::from_secs(1))
            .await
            .unwrap();

        producer.begin_transaction().await.unwrap();
        producer.send(TOPIC, "a", b"1").await.unwrap();

        assert!(broker
            .visible_records(TOPIC, IsolationLevel::ReadCommitted)
            .is_empty());
        assert_eq!(
            broker
                .visible_records(TOPIC, IsolationLevel::ReadUncommitted)
                .len(),
            1
        );

        producer
            .commit_transaction(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            broker
                .visible_records(TOPIC, IsolationLevel::ReadCommitted)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicate_batch_is_dropped() {
        let broker = InMemoryBroker::new();
        let mut producer = broker.producer("tx");
        producer
            .init_transactions(Duration::from_secs(1))
            .await
            .unwrap();

        broker.inject_send_fault(SendFault::NetworkDuplicate);
        send_committed(&mut producer, "a", b"1").await;

        assert_eq!(broker.log_len(TOPIC), 1);
    }

    #[tokio::test]
    async fn test_second_init_fences_first_producer() {
        let broker = InMemoryBroker::new();
        let mut first = broker.producer("tx");
        first.init_transactions(Duration::from_secs(1)).await.unwrap();
        first.begin_transaction().await.unwrap();
        first.send(TOPIC, "a", b"zombie").await.unwrap();

        let mut second = broker.producer("tx");
        second
            .init_transactions(Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(broker.open_transactions(), 0);
        assert!(matches!(
            first.commit_transaction(Duration::from_secs(1)).await,
            Err(Error::Fenced { .. })
        ));
        assert!(broker
            .visible_records(TOPIC, IsolationLevel::ReadCommitted)
            .is_empty());
    }

    #[tokio::test]
    async fn test_consumer_resumes_from_committed_offset() {
        let broker = InMemoryBroker::new();
        let mut producer = broker.producer("tx");
        producer
            .init_transactions(Duration::from_secs(1))
            .await
            .unwrap();
        send_committed(&mut producer, "a", b"1").await;
        send_committed(&mut producer, "b", b"2").await;

        let group = GroupConfig::new("g", StartPolicy::Earliest);
        let mut consumer = broker.consumer(&group, TOPIC);
        let first = match consumer.poll().await.unwrap() {
            PollEvent::Record(record) => record,
            other => panic!("expected record, got {:?}", other),
        };
        consumer.store_offset(&first.tp, first.offset).unwrap();
        consumer.commit().unwrap();
        consumer.close().await.unwrap();

        let mut restarted = broker.consumer(&group, TOPIC);
        match restarted.poll().await.unwrap() {
            PollEvent::Record(record) => assert_eq!(&record.payload[..], b"2"),
            other => panic!("expected record, got {:?}", other),
        }
        assert!(matches!(
            restarted.poll().await.unwrap(),
            PollEvent::PartitionEof(_)
        ));
        assert_eq!(broker.closed_consumers("g"), 1);
    }

    #[tokio::test]
    async fn test_latest_consumer_skips_history() {
        let broker = InMemoryBroker::new();
        broker.append_plain(TOPIC, Some("old"), b"old");

        let group = GroupConfig::new("g", StartPolicy::Latest);
        let mut consumer = broker.consumer(&group, TOPIC);
        assert!(matches!(
            consumer.poll().await.unwrap(),
            PollEvent::PartitionEof(_)
        ));

        broker.append_plain(TOPIC, Some("new"), b"new");
        match consumer.poll().await.unwrap() {
            PollEvent::Record(record) => assert_eq!(&record.payload[..], b"new"),
            other => panic!("expected record, got {:?}", other),
        }
    }
}
