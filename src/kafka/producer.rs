use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::debug;

use crate::broker::{DeliveryReport, PersistenceStatus, TransactionalProducer};
use crate::{config::Config, Error, Result};

/// Idempotent, transactional `FutureProducer`.
///
/// librdkafka's transaction calls block the calling thread until the
/// coordinator answers, so they run on the blocking pool.
pub struct KafkaProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &Config) -> Result<Self> {
        let publisher = &config.publisher;
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("enable.idempotence", "true")
            .set("acks", &publisher.acks)
            .set(
                "max.in.flight.requests.per.connection",
                publisher.max_in_flight.to_string(),
            )
            .set("transactional.id", &publisher.transactional_id)
            .set(
                "transaction.timeout.ms",
                publisher.transaction_timeout_ms.to_string(),
            )
            .set("message.timeout.ms", publisher.send_timeout_ms.to_string())
            .create()
            .map_err(Error::Kafka)?;

        Ok(Self {
            producer,
            send_timeout: publisher.send_timeout(),
        })
    }

    async fn blocking<F>(&self, operation: &'static str, call: F) -> Result<()>
    where
        F: FnOnce(&FutureProducer) -> std::result::Result<(), KafkaError> + Send + 'static,
    {
        let producer = self.producer.clone();
        debug!(operation, "Waiting for transaction coordinator");
        tokio::task::spawn_blocking(move || call(&producer))
            .await
            .map_err(|e| Error::Transaction {
                message: format!("{} did not complete: {}", operation, e),
            })?
            .map_err(|e| classify(operation, e))
    }
}

/// Maps librdkafka's transactional failures onto the crate's error kinds.
pub(crate) fn classify(operation: &str, error: KafkaError) -> Error {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::Fenced) | Some(RDKafkaErrorCode::ProducerFenced) => Error::Fenced {
            message: format!("{}: {}", operation, error),
        },
        Some(RDKafkaErrorCode::OperationTimedOut) | Some(RDKafkaErrorCode::RequestTimedOut) => {
            Error::Timeout {
                message: format!("{}: {}", operation, error),
            }
        }
        _ => match error {
            KafkaError::Transaction(_) => Error::Transaction {
                message: format!("{}: {}", operation, error),
            },
            other => Error::Kafka(other),
        },
    }
}

#[async_trait]
impl TransactionalProducer for KafkaProducer {
    async fn init_transactions(&mut self, timeout: Duration) -> Result<()> {
        self.blocking("init_transactions", move |p| p.init_transactions(timeout))
            .await
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.producer
            .begin_transaction()
            .map_err(|e| classify("begin_transaction", e))
    }

    async fn send(&mut self, topic: &str, key: &str, payload: &[u8]) -> Result<DeliveryReport> {
        let record = FutureRecord::to(topic).payload(payload).key(key);

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(DeliveryReport {
                partition,
                offset,
                status: PersistenceStatus::Persisted,
            }),
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut), _)) => {
                Ok(DeliveryReport {
                    partition: -1,
                    offset: -1,
                    status: PersistenceStatus::PossiblyPersisted,
                })
            }
            Err((e, _)) => Err(classify("send", e)),
        }
    }

    async fn commit_transaction(&mut self, timeout: Duration) -> Result<()> {
        self.blocking("commit_transaction", move |p| p.commit_transaction(timeout))
            .await
    }

    async fn abort_transaction(&mut self, timeout: Duration) -> Result<()> {
        self.blocking("abort_transaction", move |p| p.abort_transaction(timeout))
            .await
    }

    async fn flush(&mut self, timeout: Duration) -> Result<()> {
        self.blocking("flush", move |p| p.flush(timeout)).await
    }
}
