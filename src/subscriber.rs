//! Offset-tracked consumer group member.
//!
//! A subscriber pulls one record at a time, decodes it, hands it to a
//! [`RecordHandler`], and only then stores and commits its offset. Failed
//! records go through the [`RetryCoordinator`]: the partition is sought back
//! to the failed offset until the attempt budget runs out, after which the
//! record is routed to the dead-letter sink and committed past. A seek that
//! fails is retried before the next poll, so nothing behind an unresolved
//! record is ever stored.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{ConsumedRecord, DeadLetterSink, OffsetConsumer, PollEvent, TopicPartition};
use crate::codec::RecordCodec;
use crate::config::{Config, GroupConfig, SubscriberConfig};
use crate::dead_letter::DeadLetterContext;
use crate::position::PartitionPositions;
use crate::record::{Course, Envelope};
use crate::retry::{Resolution, RetryCoordinator};
use crate::Result;

/// A decoded record together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tp: TopicPartition,
    pub offset: i64,
    pub envelope: Envelope,
}

/// Processes decoded records for one group. An `Err` marks the record as
/// failed and subject to retry.
#[async_trait]
pub trait RecordHandler: Send {
    async fn handle(&mut self, group: &str, delivery: &Delivery) -> Result<()>;
}

#[async_trait]
impl<F> RecordHandler for F
where
    F: FnMut(&str, &Delivery) -> Result<()> + Send,
{
    async fn handle(&mut self, group: &str, delivery: &Delivery) -> Result<()> {
        (self)(group, delivery)
    }
}

/// Logs every record and accepts it.
pub struct LogHandler;

#[async_trait]
impl RecordHandler for LogHandler {
    async fn handle(&mut self, group: &str, delivery: &Delivery) -> Result<()> {
        info!(
            group,
            partition = delivery.tp.partition,
            offset = delivery.offset,
            key = %delivery.envelope.key,
            "Message received: {}",
            delivery.envelope.value.description
        );
        debug!(group, id = %delivery.envelope.value.id, "Processing message");
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Records handled successfully and stored for commit.
    pub processed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub decode_failures: u64,
    pub consumer_errors: u64,
}

pub struct OffsetTrackedSubscriber<C, D> {
    group: GroupConfig,
    consumer: C,
    dead_letter: D,
    codec: Arc<dyn RecordCodec<Course>>,
    handler: Box<dyn RecordHandler>,
    config: SubscriberConfig,
    positions: PartitionPositions,
    retries: RetryCoordinator,
    /// Record the consumer still has to be repositioned on.
    pending_seek: Option<(TopicPartition, i64)>,
    stats: SubscriberStats,
}

impl<C: OffsetConsumer, D: DeadLetterSink> OffsetTrackedSubscriber<C, D> {
    pub fn new(
        group: GroupConfig,
        consumer: C,
        dead_letter: D,
        codec: Arc<dyn RecordCodec<Course>>,
        config: &Config,
    ) -> Self {
        Self {
            group,
            consumer,
            dead_letter,
            codec,
            handler: Box::new(LogHandler),
            config: config.subscriber.clone(),
            positions: PartitionPositions::new(),
            retries: RetryCoordinator::new(config.retry.max_attempts),
            pending_seek: None,
            stats: SubscriberStats::default(),
        }
    }

    pub fn with_handler(mut self, handler: Box<dyn RecordHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn group(&self) -> &GroupConfig {
        &self.group
    }

    /// Consumes until `cancel` fires or the error budget is spent, then
    /// commits whatever was stored and leaves the group.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<SubscriberStats> {
        info!(
            group = %self.group.id,
            start = self.group.start.as_str(),
            isolation = self.group.isolation.as_str(),
            "Consumer started"
        );

        let consumed = self.consume(&cancel).await;
        let closed = self.shutdown().await;

        match (consumed, closed) {
            (Ok(()), Ok(())) => {
                info!(group = %self.group.id, stats = ?self.stats, "Consumer stopped");
                Ok(self.stats)
            }
            (Err(e), _) | (Ok(()), Err(e)) => {
                error!(group = %self.group.id, error = %e, "Consumer terminated");
                Err(e)
            }
        }
    }

    async fn consume(&mut self, cancel: &CancellationToken) -> Result<()> {
        let poll_timeout = self.config.poll_timeout();
        let mut consecutive_errors = 0u32;

        loop {
            let result = if self.pending_seek.is_some() {
                self.seek_back()
            } else {
                let polled = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    polled = tokio::time::timeout(poll_timeout, self.consumer.poll()) => polled,
                };

                match polled {
                    // Idle poll
                    Err(_) => continue,
                    Ok(Ok(PollEvent::PartitionEof(tp))) => {
                        debug!(group = %self.group.id, partition = tp.partition, "Reached end of partition");
                        Ok(())
                    }
                    Ok(Ok(PollEvent::Record(record))) => self.process(record).await,
                    Ok(Err(e)) => Err(e),
                }
            };

            match result {
                Ok(()) => consecutive_errors = 0,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    consecutive_errors += 1;
                    self.stats.consumer_errors += 1;
                    error!(
                        group = %self.group.id,
                        error = %e,
                        consecutive_errors,
                        "Consumer error"
                    );
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        return Err(e);
                    }
                    if !backoff(cancel, self.config.error_backoff()).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn process(&mut self, record: ConsumedRecord) -> Result<()> {
        let tp = record.tp.clone();
        let offset = record.offset;
        self.positions.begin(&tp, offset);

        let outcome = match self.codec.decode(&tp.topic, &record.payload).await {
            Ok(value) => {
                let delivery = Delivery {
                    tp: tp.clone(),
                    offset,
                    envelope: Envelope {
                        key: record.key.clone().unwrap_or_default(),
                        value,
                    },
                };
                self.handler.handle(&self.group.id, &delivery).await
            }
            Err(e) => {
                self.stats.decode_failures += 1;
                Err(e)
            }
        };

        let reason = match &outcome {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    group = %self.group.id,
                    partition = tp.partition,
                    offset,
                    error = %e,
                    "Failed to process message"
                );
                Some(e.to_string())
            }
        };

        match self.retries.resolve(&tp, offset, outcome.is_ok()) {
            Resolution::Commit => {
                self.store(&tp, offset)?;
                self.stats.processed += 1;
                self.commit()
            }
            Resolution::Retry { seek_to, attempt } => {
                warn!(
                    group = %self.group.id,
                    partition = tp.partition,
                    offset,
                    attempt,
                    max_attempts = self.retries.max_attempts(),
                    "Retrying message"
                );
                self.stats.retried += 1;
                self.rewind_to(&tp, seek_to)
            }
            Resolution::DeadLetter { deliveries } => {
                let context = DeadLetterContext::new(
                    &record,
                    self.group.id.clone(),
                    deliveries,
                    reason.unwrap_or_default(),
                );
                if let Err(e) = self.dead_letter.route(&record, &context).await {
                    error!(
                        group = %self.group.id,
                        partition = tp.partition,
                        offset,
                        error = %e,
                        "Failed to route message to dead-letter topic"
                    );
                    if let Err(seek_error) = self.rewind_to(&tp, offset) {
                        warn!(
                            group = %self.group.id,
                            partition = tp.partition,
                            offset,
                            error = %seek_error,
                            "Seek back failed, retrying before the next poll"
                        );
                    }
                    return Err(e);
                }

                warn!(
                    group = %self.group.id,
                    partition = tp.partition,
                    offset,
                    deliveries,
                    "Message sent to dead-letter topic"
                );
                self.retries.settle(&tp);
                self.store(&tp, offset)?;
                self.stats.dead_lettered += 1;
                self.commit()
            }
        }
    }

    fn store(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        self.consumer.store_offset(tp, offset)?;
        self.positions.mark_stored(tp, offset)
    }

    fn rewind_to(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        self.pending_seek = Some((tp.clone(), offset));
        self.seek_back()
    }

    /// Moves the consumer back onto the unresolved record, if there is one.
    fn seek_back(&mut self) -> Result<()> {
        if let Some((tp, offset)) = self.pending_seek.clone() {
            self.consumer.seek(&tp, offset)?;
            self.positions.rewind(&tp, offset)?;
            self.pending_seek = None;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.consumer.commit()?;
        for (tp, offset) in self.positions.mark_committed()? {
            debug!(group = %self.group.id, partition = tp.partition, offset, "Offset committed");
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        let mut result = Ok(());
        if self.positions.has_uncommitted() {
            if let Err(e) = self.commit() {
                error!(group = %self.group.id, error = %e, "Failed to commit stored offsets on close");
                result = Err(e);
            }
        }
        if let Err(e) = self.consumer.close().await {
            error!(group = %self.group.id, error = %e, "Failed to close consumer");
            if result.is_ok() {
                result = Err(e);
            }
        }
        info!(group = %self.group.id, "Consumer closed");
        result
    }
}

/// Sleeps for `delay`; false when cancelled meanwhile.
async fn backoff(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
