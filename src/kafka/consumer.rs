use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{ClientConfig, ClientContext, Message, Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{ConsumedRecord, OffsetConsumer, PollEvent, TopicPartition};
use crate::config::{Config, GroupConfig};
use crate::{Error, Result};

/// Logs offset commits for one group.
pub struct GroupContext {
    group: String,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => {
                for elem in offsets.elements() {
                    debug!(
                        group = %self.group,
                        partition = elem.partition(),
                        offset = ?elem.offset(),
                        "Offset committed"
                    );
                }
            }
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(err) => error!(group = %self.group, "Commit callback error: {}", err),
        }
    }
}

/// Group member with manual offset store and synchronous commits.
pub struct KafkaConsumer {
    consumer: StreamConsumer<GroupContext>,
    topic: String,
    group: String,
    seek_timeout: Duration,
    closed: bool,
}

impl KafkaConsumer {
    pub fn new(config: &Config, group: &GroupConfig) -> Result<Self> {
        let client_id = format!("{}-{}", group.id, &Uuid::new_v4().simple().to_string()[..5]);

        let consumer: StreamConsumer<GroupContext> = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("group.id", &group.id)
            .set("client.id", &client_id)
            .set("auto.offset.reset", group.start.as_str())
            .set("isolation.level", group.isolation.as_str())
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "true")
            .set(
                "session.timeout.ms",
                config.subscriber.session_timeout_ms.to_string(),
            )
            .create_with_context(GroupContext {
                group: group.id.clone(),
            })
            .map_err(Error::Kafka)?;

        consumer
            .subscribe(&[config.broker.topic.as_str()])
            .map_err(Error::Kafka)?;
        info!(group = %group.id, client_id = %client_id, topic = %config.broker.topic, "Subscribed");

        Ok(Self {
            consumer,
            topic: config.broker.topic.clone(),
            group: group.id.clone(),
            seek_timeout: config.subscriber.poll_timeout(),
            closed: false,
        })
    }
}

#[async_trait]
impl OffsetConsumer for KafkaConsumer {
    async fn poll(&mut self) -> Result<PollEvent> {
        match self.consumer.recv().await {
            Ok(message) => Ok(PollEvent::Record(ConsumedRecord {
                tp: TopicPartition::new(message.topic(), message.partition()),
                offset: message.offset(),
                key: message
                    .key()
                    .map(|key| String::from_utf8_lossy(key).into_owned()),
                payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
            })),
            Err(KafkaError::PartitionEOF(partition)) => Ok(PollEvent::PartitionEof(
                TopicPartition::new(self.topic.clone(), partition),
            )),
            Err(e) => Err(Error::Kafka(e)),
        }
    }

    fn store_offset(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        // The stored offset is the next one to read
        self.consumer
            .store_offset(&tp.topic, tp.partition, offset + 1)
            .map_err(Error::Kafka)
    }

    fn commit(&mut self) -> Result<()> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(Error::Kafka(e)),
        }
    }

    fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        self.consumer
            .seek(&tp.topic, tp.partition, Offset::Offset(offset), self.seek_timeout)
            .map_err(Error::Kafka)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let committed = self.commit();
        if let Err(e) = &committed {
            warn!(group = %self.group, error = %e, "Final offset commit failed");
        }
        self.consumer.unsubscribe();
        info!(group = %self.group, "Left consumer group");
        committed
    }
}
