use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use super::RecordCodec;
use crate::{Error, Result};

/// Schema-less JSON codec.
pub struct JsonCodec;

#[async_trait]
impl<T> RecordCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn encode(&self, _topic: &str, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(Into::into)
    }

    async fn decode(&self, topic: &str, payload: &[u8]) -> Result<T> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::codec(format!("payload on '{}' is not a valid record: {}", topic, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Course;

    #[tokio::test]
    async fn test_json_round_trip() {
        let course = Course::for_index(3);
        let bytes = RecordCodec::<Course>::encode(&JsonCodec, "t", &course)
            .await
            .unwrap();
        assert!(std::str::from_utf8(&bytes).unwrap().contains("Curso Kafka Avro - 3"));

        let decoded = RecordCodec::<Course>::decode(&JsonCodec, "t", &bytes)
            .await
            .unwrap();
        assert_eq!(decoded, course);
    }

    #[tokio::test]
    async fn test_json_shape_mismatch() {
        let result = RecordCodec::<Course>::decode(&JsonCodec, "t", br#"{"id": 1}"#).await;
        assert!(matches!(result, Err(Error::Codec { .. })));
    }
}
