use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::time::Duration;

use crate::broker::{ConsumedRecord, DeadLetterSink};
use crate::config::Config;
use crate::dead_letter::{DeadLetterContext, DLQ_METADATA_HEADER};
use crate::{Error, Result};

/// Forwards records to the dead-letter topic with their original key and
/// payload, plus an `x-dlq-metadata` header.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaDeadLetterSink {
    pub fn new(config: &Config) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("message.timeout.ms", config.publisher.send_timeout_ms.to_string())
            .create()
            .map_err(Error::Kafka)?;

        Ok(Self {
            producer,
            topic: config.dead_letter_topic(),
            timeout: config.publisher.send_timeout(),
        })
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn route(&mut self, record: &ConsumedRecord, context: &DeadLetterContext) -> Result<()> {
        let metadata = context.to_header_value()?;
        let headers = OwnedHeaders::new().insert(Header {
            key: DLQ_METADATA_HEADER,
            value: Some(metadata.as_slice()),
        });

        let message = FutureRecord::to(&self.topic)
            .payload(&record.payload[..])
            .key(record.key.as_deref().unwrap_or(""))
            .headers(headers);

        self.producer
            .send(message, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| Error::DeadLetter {
                message: format!("failed to write to '{}': {}", self.topic, e),
            })?;
        Ok(())
    }
}
