//! Record encoding against a schema authority.
//!
//! The publisher and subscribers only see [`RecordCodec`]. Two formats are
//! available: Avro in the Confluent wire format backed by a schema registry
//! ([`AvroCodec`]), and plain JSON ([`JsonCodec`]).

pub mod avro;
pub mod json;
pub mod registry;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use crate::config::{CodecFormat, Config};
use crate::record::Course;
use crate::Result;

pub use avro::AvroCodec;
pub use json::JsonCodec;
pub use registry::{HttpSchemaRegistry, InMemorySchemaRegistry, SchemaRegistry};

/// Encodes and decodes values of `T` for a topic.
///
/// Implementations are deterministic and satisfy
/// `decode(topic, encode(topic, v)) == v`. Shape mismatches are reported as
/// [`Error::Codec`](crate::Error::Codec).
#[async_trait]
pub trait RecordCodec<T: Send + Sync>: Send + Sync {
    async fn encode(&self, topic: &str, value: &T) -> Result<Bytes>;

    async fn decode(&self, topic: &str, payload: &[u8]) -> Result<T>;
}

/// A type with a fixed Avro schema.
pub trait AvroRecord: Serialize + DeserializeOwned + Send + Sync {
    fn schema() -> &'static str;
}

const COURSE_SCHEMA: &str = r#"{
    "type": "record",
    "name": "Curso",
    "namespace": "KafkaEstudo",
    "fields": [
        {"name": "id", "type": "string"},
        {"name": "description", "type": "string"}
    ]
}"#;

impl AvroRecord for Course {
    fn schema() -> &'static str {
        COURSE_SCHEMA
    }
}

/// Builds the codec selected by `codec.format`.
pub fn from_config(config: &Config) -> Result<Arc<dyn RecordCodec<Course>>> {
    match config.codec.format {
        CodecFormat::Avro => {
            let registry = HttpSchemaRegistry::new(&config.schema_registry)?;
            Ok(Arc::new(AvroCodec::<Course, _>::new(registry)?))
        }
        CodecFormat::Json => Ok(Arc::new(JsonCodec)),
    }
}
