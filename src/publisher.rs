//! Transactional publisher: one record per transaction.
//!
//! Each call to [`TransactionalPublisher::publish`] builds a fresh
//! [`Envelope`], opens a transaction, sends it, and commits only when the
//! broker reports the record as persisted. Anything else aborts, so a
//! `read_committed` reader sees the record exactly once or not at all.

use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{PersistenceStatus, TransactionalProducer};
use crate::codec::RecordCodec;
use crate::config::PublisherConfig;
use crate::record::{Course, Envelope};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Uninitialized,
    Initialized,
    Open,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The codec rejected the value; nothing reached the broker.
    Encode(String),
    NotPersisted(PersistenceStatus),
    Broker(String),
    CommitFailed(String),
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Encode(e) => write!(f, "encoding failed: {}", e),
            FailureReason::NotPersisted(status) => write!(f, "broker reported {:?}", status),
            FailureReason::Broker(e) => write!(f, "broker error: {}", e),
            FailureReason::CommitFailed(e) => write!(f, "commit failed: {}", e),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Persisted {
        index: u64,
        key: String,
        partition: i32,
        offset: i64,
    },
    Failed {
        index: u64,
        reason: FailureReason,
    },
}

impl PublishOutcome {
    pub fn is_persisted(&self) -> bool {
        matches!(self, PublishOutcome::Persisted { .. })
    }
}

pub struct TransactionalPublisher<P> {
    producer: P,
    codec: Arc<dyn RecordCodec<Course>>,
    topic: String,
    config: PublisherConfig,
    state: TransactionState,
}

impl<P: TransactionalProducer> TransactionalPublisher<P> {
    pub fn new(
        producer: P,
        codec: Arc<dyn RecordCodec<Course>>,
        topic: impl Into<String>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            producer,
            codec,
            topic: topic.into(),
            config,
            state: TransactionState::Uninitialized,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Registers the transactional id. Runs once per publisher; later calls
    /// return immediately.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.state != TransactionState::Uninitialized {
            return Ok(());
        }

        debug!(
            transactional_id = %self.config.transactional_id,
            timeout_ms = self.config.init_timeout_ms,
            "Initializing transactions"
        );
        if let Err(e) = self
            .producer
            .init_transactions(self.config.init_timeout())
            .await
        {
            error!(
                transactional_id = %self.config.transactional_id,
                error = %e,
                "Failed to initialize transactions"
            );
            return Err(e);
        }

        self.state = TransactionState::Initialized;
        Ok(())
    }

    /// Publishes the `index`-th record in its own transaction.
    ///
    /// Recoverable failures come back as [`PublishOutcome::Failed`] with the
    /// transaction aborted. `Err` means the publisher cannot continue.
    #[instrument(skip(self, cancel), fields(topic = %self.topic))]
    pub async fn publish(&mut self, index: u64, cancel: &CancellationToken) -> Result<PublishOutcome> {
        if self.state == TransactionState::Open {
            return Err(Error::InvalidState {
                message: "previous transaction was neither committed nor aborted".to_string(),
            });
        }
        self.initialize().await?;

        let envelope = Envelope::new(Course::for_index(index));
        info!(index, key = %envelope.key, "Producing message");

        let payload = match self.codec.encode(&self.topic, &envelope.value).await {
            Ok(payload) => payload,
            Err(e) => {
                error!(index, error = %e, "Failed to encode message");
                return Ok(PublishOutcome::Failed {
                    index,
                    reason: FailureReason::Encode(e.to_string()),
                });
            }
        };

        if let Err(e) = self.producer.begin_transaction().await {
            error!(index, error = %e, "Failed to begin transaction");
            if e.is_fatal() {
                return Err(e);
            }
            return Ok(PublishOutcome::Failed {
                index,
                reason: FailureReason::Broker(e.to_string()),
            });
        }
        self.state = TransactionState::Open;

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            report = self.producer.send(&self.topic, &envelope.key, &payload) => Some(report),
        };

        let report = match sent {
            None => {
                warn!(index, "Publish cancelled, aborting transaction");
                self.abort(index).await?;
                return Ok(PublishOutcome::Failed {
                    index,
                    reason: FailureReason::Cancelled,
                });
            }
            Some(Err(e)) if matches!(e, Error::Fenced { .. }) => {
                error!(index, error = %e, "Producer fenced while sending");
                self.state = TransactionState::Aborted;
                return Err(e);
            }
            Some(Err(e)) => {
                error!(index, error = %e, "Failed to produce message");
                self.abort(index).await?;
                return Ok(PublishOutcome::Failed {
                    index,
                    reason: FailureReason::Broker(e.to_string()),
                });
            }
            Some(Ok(report)) => report,
        };

        if report.status != PersistenceStatus::Persisted {
            warn!(
                index,
                status = ?report.status,
                "Message was not persisted, aborting transaction"
            );
            self.abort(index).await?;
            return Ok(PublishOutcome::Failed {
                index,
                reason: FailureReason::NotPersisted(report.status),
            });
        }

        match self
            .producer
            .commit_transaction(self.config.transaction_timeout())
            .await
        {
            Ok(()) => {
                self.state = TransactionState::Committed;
                info!(
                    index,
                    partition = report.partition,
                    offset = report.offset,
                    "Message {} sent to {}[{}]@{}",
                    index,
                    self.topic,
                    report.partition,
                    report.offset
                );
                Ok(PublishOutcome::Persisted {
                    index,
                    key: envelope.key,
                    partition: report.partition,
                    offset: report.offset,
                })
            }
            Err(e @ Error::Fenced { .. }) => {
                error!(index, error = %e, "Producer fenced while committing");
                self.state = TransactionState::Aborted;
                Err(e)
            }
            Err(e) => {
                warn!(index, error = %e, "Commit failed, aborting transaction");
                self.abort(index).await?;
                Ok(PublishOutcome::Failed {
                    index,
                    reason: FailureReason::CommitFailed(e.to_string()),
                })
            }
        }
    }

    async fn abort(&mut self, index: u64) -> Result<()> {
        match self
            .producer
            .abort_transaction(self.config.transaction_timeout())
            .await
        {
            Ok(()) => {
                self.state = TransactionState::Aborted;
                warn!(index, "Message {} failed and the transaction was aborted", index);
                Ok(())
            }
            Err(e) => {
                error!(index, error = %e, "Failed to abort transaction");
                Err(Error::Transaction {
                    message: format!("abort of transaction for message {} failed: {}", index, e),
                })
            }
        }
    }

    /// Aborts an open transaction, if any, and flushes the producer.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == TransactionState::Open {
            self.abort(0).await?;
        }
        self.producer.flush(self.config.send_timeout()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{InMemoryBroker, SendFault};
    use crate::codec::JsonCodec;
    use crate::config::IsolationLevel;
    use async_trait::async_trait;
    use bytes::Bytes;

    const TOPIC: &str = "KafkaEstudo";

    fn publisher(broker: &InMemoryBroker) -> TransactionalPublisher<crate::broker::memory::MemoryProducer> {
        TransactionalPublisher::new(
            broker.producer("tx-test"),
            Arc::new(JsonCodec),
            TOPIC,
            PublisherConfig::default(),
        )
    }

    struct RejectingCodec;

    #[async_trait]
    impl RecordCodec<Course> for RejectingCodec {
        async fn encode(&self, _topic: &str, _value: &Course) -> Result<Bytes> {
            Err(Error::codec("subject has an incompatible schema"))
        }

        async fn decode(&self, _topic: &str, _payload: &[u8]) -> Result<Course> {
            Err(Error::codec("subject has an incompatible schema"))
        }
    }

    #[tokio::test]
    async fn test_publish_commits() {
        let broker = InMemoryBroker::new();
        let mut publisher = publisher(&broker);
        let cancel = CancellationToken::new();

        let outcome = publisher.publish(1, &cancel).await.unwrap();
        assert!(outcome.is_persisted());
        assert_eq!(publisher.state(), TransactionState::Committed);
        assert_eq!(
            broker
                .visible_records(TOPIC, IsolationLevel::ReadCommitted)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_initializes_once() {
        let broker = InMemoryBroker::new();
        let mut publisher = publisher(&broker);
        let cancel = CancellationToken::new();

        publisher.publish(1, &cancel).await.unwrap();
        // a second init would fail here
        broker.fail_next_inits(1);
        assert!(publisher.publish(2, &cancel).await.unwrap().is_persisted());
    }

    #[tokio::test]
    async fn test_init_timeout_is_fatal() {
        let broker = InMemoryBroker::new();
        broker.fail_next_inits(1);
        let mut publisher = publisher(&broker);

        let result = publisher.publish(1, &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(publisher.state(), TransactionState::Uninitialized);
        assert_eq!(broker.log_len(TOPIC), 0);
    }

    #[tokio::test]
    async fn test_not_persisted_aborts() {
        let broker = InMemoryBroker::new();
        let mut publisher = publisher(&broker);
        broker.inject_send_fault(SendFault::NotPersisted);

        let outcome = publisher.publish(7, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::Failed {
                index: 7,
                reason: FailureReason::NotPersisted(PersistenceStatus::NotPersisted),
            }
        );
        assert_eq!(publisher.state(), TransactionState::Aborted);
        assert_eq!(broker.log_len(TOPIC), 1);
        assert!(broker
            .visible_records(TOPIC, IsolationLevel::ReadCommitted)
            .is_empty());
    }

    #[tokio::test]
    async fn test_lost_ack_aborts() {
        let broker = InMemoryBroker::new();
        let mut publisher = publisher(&broker);
        broker.inject_send_fault(SendFault::LostAcknowledgement);

        let outcome = publisher.publish(3, &CancellationToken::new()).await.unwrap();
        assert!(matches!(
            outcome,
            PublishOutcome::Failed {
                reason: FailureReason::Broker(_),
                ..
            }
        ));
        assert_eq!(publisher.state(), TransactionState::Aborted);
        assert_eq!(broker.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_commit_failure_aborts() {
        let broker = InMemoryBroker::new();
        let mut publisher = publisher(&broker);
        broker.fail_next_transaction_commits(1);

        let outcome = publisher.publish(4, &CancellationToken::new()).await.unwrap();
        assert!(matches!(
            outcome,
            PublishOutcome::Failed {
                reason: FailureReason::CommitFailed(_),
                ..
            }
        ));
        assert!(broker
            .visible_records(TOPIC, IsolationLevel::ReadCommitted)
            .is_empty());

        // the publisher is reusable after an abort
        assert!(publisher
            .publish(5, &CancellationToken::new())
            .await
            .unwrap()
            .is_persisted());
    }

    #[tokio::test]
    async fn test_encode_failure_opens_no_transaction() {
        let broker = InMemoryBroker::new();
        let mut publisher = TransactionalPublisher::new(
            broker.producer("tx-test"),
            Arc::new(RejectingCodec),
            TOPIC,
            PublisherConfig::default(),
        );

        let outcome = publisher.publish(1, &CancellationToken::new()).await.unwrap();
        assert!(matches!(
            outcome,
            PublishOutcome::Failed {
                reason: FailureReason::Encode(_),
                ..
            }
        ));
        assert_eq!(publisher.state(), TransactionState::Initialized);
        assert_eq!(broker.log_len(TOPIC), 0);
        assert_eq!(broker.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_publish_aborts() {
        let broker = InMemoryBroker::new();
        let mut publisher = publisher(&broker);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = publisher.publish(1, &cancel).await.unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::Failed {
                index: 1,
                reason: FailureReason::Cancelled
            }
        );
        assert_eq!(broker.open_transactions(), 0);
        assert!(broker
            .visible_records(TOPIC, IsolationLevel::ReadCommitted)
            .is_empty());
    }

    #[tokio::test]
    async fn test_fenced_publisher_stops() {
        let broker = InMemoryBroker::new();
        let mut first = publisher(&broker);
        let cancel = CancellationToken::new();
        first.publish(1, &cancel).await.unwrap();

        let mut second = publisher(&broker);
        second.publish(2, &cancel).await.unwrap();

        let result = first.publish(3, &cancel).await;
        assert!(matches!(result, Err(Error::Fenced { .. })));
        assert_eq!(
            broker
                .visible_records(TOPIC, IsolationLevel::ReadCommitted)
                .len(),
            2
        );
    }
}
