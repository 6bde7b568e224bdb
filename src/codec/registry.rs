//! Schema registry clients.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::SchemaRegistryConfig;
use crate::{Error, Result};

const CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

/// The two registry calls the codec needs.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Registers `schema` under `subject` (idempotent) and returns its id.
    async fn register(&self, subject: &str, schema: &str) -> Result<i32>;

    /// Fetches the schema text registered with `id`.
    async fn schema_by_id(&self, id: i32) -> Result<String>;
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    schema: &'a str,
}

#[derive(Deserialize)]
struct RegisterResponse {
    id: i32,
}

#[derive(Deserialize)]
struct SchemaResponse {
    schema: String,
}

/// Client for the Confluent-compatible REST API.
pub struct HttpSchemaRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSchemaRegistry {
    pub fn new(config: &SchemaRegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn register(&self, subject: &str, schema: &str) -> Result<i32> {
        let url = format!("{}/subjects/{}/versions", self.base_url, subject);
        debug!(%url, "Registering schema");

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .json(&RegisterRequest { schema })
            .send()
            .await?;

        match response.status() {
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::codec(format!(
                    "registry rejected schema for subject '{}': {}",
                    subject, body
                )))
            }
            _ => {
                let registered: RegisterResponse = response.error_for_status()?.json().await?;
                info!(subject, id = registered.id, "Schema registered");
                Ok(registered.id)
            }
        }
    }

    async fn schema_by_id(&self, id: i32) -> Result<String> {
        let url = format!("{}/schemas/ids/{}", self.base_url, id);
        let response = self.client.get(&url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::codec(format!("unknown schema id {}", id)));
        }

        let found: SchemaResponse = response.error_for_status()?.json().await?;
        Ok(found.schema)
    }
}

#[derive(Default)]
struct RegistryState {
    ids_by_schema: HashMap<String, i32>,
    schemas: HashMap<i32, String>,
    subjects: HashMap<String, Vec<i32>>,
}

/// Registry kept in process memory.
///
/// Identical schema text gets the same id across subjects, like the real
/// registry. Schemas are parsed on registration so malformed ones are
/// rejected.
#[derive(Default)]
pub struct InMemorySchemaRegistry {
    state: Mutex<RegistryState>,
    calls: AtomicUsize,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `register` and `schema_by_id` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn versions(&self, subject: &str) -> Vec<i32> {
        self.state
            .lock()
            .map(|state| state.subjects.get(subject).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn register(&self, subject: &str, schema: &str) -> Result<i32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let parsed = apache_avro::Schema::parse_str(schema)
            .map_err(|e| Error::codec(format!("invalid schema for '{}': {}", subject, e)))?;
        let canonical = parsed.canonical_form();

        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::codec("schema registry state poisoned"))?;
        let next_id = state.schemas.len() as i32 + 1;
        let id = *state.ids_by_schema.entry(canonical).or_insert(next_id);
        state.schemas.entry(id).or_insert_with(|| schema.to_string());

        let versions = state.subjects.entry(subject.to_string()).or_default();
        if !versions.contains(&id) {
            versions.push(id);
        }
        Ok(id)
    }

    async fn schema_by_id(&self, id: i32) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self
            .state
            .lock()
            .map_err(|_| Error::codec("schema registry state poisoned"))?;
        state
            .schemas
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::codec(format!("unknown schema id {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"{"type":"record","name":"T","fields":[{"name":"a","type":"string"}]}"#;

    #[tokio::test]
    async fn test_same_schema_same_id() {
        let registry = InMemorySchemaRegistry::new();
        let first = registry.register("a-value", SCHEMA).await.unwrap();
        let second = registry.register("b-value", SCHEMA).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.versions("a-value"), vec![first]);
        assert_eq!(registry.schema_by_id(first).await.unwrap(), SCHEMA);
    }

    #[tokio::test]
    async fn test_rejects_malformed_schema() {
        let registry = InMemorySchemaRegistry::new();
        let result = registry.register("a-value", "{\"type\": \"nope\"}").await;
        assert!(matches!(result, Err(Error::Codec { .. })));
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let registry = InMemorySchemaRegistry::new();
        assert!(matches!(
            registry.schema_by_id(42).await,
            Err(Error::Codec { .. })
        ));
    }

    #[test]
    fn test_http_registry_trims_trailing_slash() {
        let config = SchemaRegistryConfig {
            url: "http://localhost:8081/".to_string(),
            request_timeout_ms: 1_000,
        };
        let registry = HttpSchemaRegistry::new(&config).unwrap();
        assert_eq!(registry.base_url, "http://localhost:8081");
    }
}
