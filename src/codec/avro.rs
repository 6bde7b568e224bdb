//! Avro codec using the Confluent wire format.
//!
//! A framed payload is the magic byte `0x00`, the writer schema id as a
//! big-endian `i32`, then the Avro binary datum.

use apache_avro::Schema;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::{AvroRecord, RecordCodec, SchemaRegistry};
use crate::{Error, Result};

pub const MAGIC_BYTE: u8 = 0x00;
const HEADER_LEN: usize = 5;

/// Splits a framed payload into schema id and datum.
pub fn split_frame(payload: &[u8]) -> Result<(i32, &[u8])> {
    if payload.len() < HEADER_LEN {
        return Err(Error::codec(format!(
            "payload of {} bytes is shorter than the wire header",
            payload.len()
        )));
    }
    if payload[0] != MAGIC_BYTE {
        return Err(Error::codec(format!("unknown magic byte {:#04x}", payload[0])));
    }
    let id = i32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    Ok((id, &payload[HEADER_LEN..]))
}

pub fn frame(schema_id: i32, datum: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + datum.len());
    buf.put_u8(MAGIC_BYTE);
    buf.put_i32(schema_id);
    buf.extend_from_slice(datum);
    buf.freeze()
}

/// Avro codec for `T`, registering and resolving schemas through `R`.
///
/// Writer ids (per subject) and writer schemas (per id) are cached, so the
/// registry is hit once per subject and once per foreign schema id.
pub struct AvroCodec<T, R> {
    registry: R,
    schema: Schema,
    subject_ids: RwLock<HashMap<String, i32>>,
    writer_schemas: RwLock<HashMap<i32, Arc<Schema>>>,
    _record: PhantomData<fn() -> T>,
}

impl<T: AvroRecord, R: SchemaRegistry> AvroCodec<T, R> {
    pub fn new(registry: R) -> Result<Self> {
        let schema = Schema::parse_str(T::schema())?;
        Ok(Self {
            registry,
            schema,
            subject_ids: RwLock::new(HashMap::new()),
            writer_schemas: RwLock::new(HashMap::new()),
            _record: PhantomData,
        })
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    async fn subject_id(&self, topic: &str) -> Result<i32> {
        let subject = format!("{}-value", topic);
        if let Some(id) = self
            .subject_ids
            .read()
            .ok()
            .and_then(|ids| ids.get(&subject).copied())
        {
            return Ok(id);
        }

        let id = self
            .registry
            .register(&subject, &self.schema.canonical_form())
            .await?;
        if let Ok(mut ids) = self.subject_ids.write() {
            ids.insert(subject, id);
        }
        Ok(id)
    }

    async fn writer_schema(&self, id: i32) -> Result<Arc<Schema>> {
        if let Some(schema) = self
            .writer_schemas
            .read()
            .ok()
            .and_then(|schemas| schemas.get(&id).cloned())
        {
            return Ok(schema);
        }

        debug!(id, "Fetching writer schema");
        let text = self.registry.schema_by_id(id).await?;
        let schema = Arc::new(
            Schema::parse_str(&text)
                .map_err(|e| Error::codec(format!("schema {} is not valid Avro: {}", id, e)))?,
        );
        if let Ok(mut schemas) = self.writer_schemas.write() {
            schemas.insert(id, Arc::clone(&schema));
        }
        Ok(schema)
    }
}

#[async_trait]
impl<T, R> RecordCodec<T> for AvroCodec<T, R>
where
    T: AvroRecord,
    R: SchemaRegistry,
{
    async fn encode(&self, topic: &str, value: &T) -> Result<Bytes> {
        let datum = apache_avro::to_value(value)
            .and_then(|value| value.resolve(&self.schema))
            .and_then(|value| apache_avro::to_avro_datum(&self.schema, value))
            .map_err(|e| Error::codec(format!("value does not match schema: {}", e)))?;

        let id = self.subject_id(topic).await?;
        Ok(frame(id, &datum))
    }

    async fn decode(&self, _topic: &str, payload: &[u8]) -> Result<T> {
        let (id, mut datum) = split_frame(payload)?;
        let writer = self.writer_schema(id).await?;

        let value = apache_avro::from_avro_datum(&writer, &mut datum, Some(&self.schema))
            .map_err(|e| Error::codec(format!("cannot read datum with schema {}: {}", id, e)))?;
        apache_avro::from_value::<T>(&value)
            .map_err(|e| Error::codec(format!("datum does not fit the record type: {}", e)))
    }
}
