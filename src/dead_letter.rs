//! Metadata attached to records routed to the dead-letter topic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::ConsumedRecord;
use crate::Result;

/// Header carrying the JSON-encoded [`DeadLetterContext`].
pub const DLQ_METADATA_HEADER: &str = "x-dlq-metadata";

/// Why and where a record was given up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterContext {
    pub reason: String,
    pub attempts: u32,
    pub consumer_group: String,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterContext {
    pub fn new(
        record: &ConsumedRecord,
        consumer_group: impl Into<String>,
        attempts: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            reason: reason.into(),
            attempts,
            consumer_group: consumer_group.into(),
            source_topic: record.tp.topic.clone(),
            source_partition: record.tp.partition,
            source_offset: record.offset,
            failed_at: Utc::now(),
        }
    }

    pub fn to_header_value(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Into::into)
    }

    pub fn from_header_value(value: &[u8]) -> Result<Self> {
        serde_json::from_slice(value).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::TopicPartition;
    use bytes::Bytes;

    #[test]
    fn test_context_captures_source_position() {
        let record = ConsumedRecord {
            tp: TopicPartition::new("KafkaEstudo", 2),
            offset: 41,
            key: Some("k".to_string()),
            payload: Bytes::from_static(b"\x00"),
        };

        let context = DeadLetterContext::new(&record, "grupo1", 3, "handler rejected record");
        let header = context.to_header_value().unwrap();
        let parsed = DeadLetterContext::from_header_value(&header).unwrap();

        assert_eq!(parsed, context);
        assert_eq!(parsed.source_partition, 2);
        assert_eq!(parsed.source_offset, 41);
        assert_eq!(parsed.consumer_group, "grupo1");
    }
}
