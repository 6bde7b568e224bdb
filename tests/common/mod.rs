#![allow(dead_code)]

use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use txn_pubsub::codec::{AvroCodec, InMemorySchemaRegistry, RecordCodec};
use txn_pubsub::config::{Config, GroupConfig, StartPolicy};
use txn_pubsub::record::Course;
use txn_pubsub::subscriber::{Delivery, RecordHandler};

/// Configuration tuned for the in-memory broker: short polls and backoffs.
pub fn get_test_config() -> Config {
    let mut config = Config::default();
    config.subscriber.poll_timeout_ms = 50;
    config.subscriber.error_backoff_ms = 10;
    config.retry.max_attempts = 3;
    config.groups = vec![
        GroupConfig::new("grupo1", StartPolicy::Earliest),
        GroupConfig::new("grupo2", StartPolicy::Latest),
    ];
    config
}

/// Configuration for a real cluster, from `TEST_` environment variables.
pub fn get_kafka_test_config() -> Config {
    let mut config = get_test_config();
    config.broker.brokers = env::var("TEST_KAFKA_BROKERS")
        .unwrap_or_else(|_| "localhost:9092".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .collect();
    config.broker.topic = format!("test_courses_{}", std::process::id());
    config.schema_registry.url = env::var("TEST_SCHEMA_REGISTRY_URL")
        .unwrap_or_else(|_| "http://localhost:8081".to_string());
    config.publisher.transactional_id = format!("test_tx_{}", std::process::id());
    config.subscriber.poll_timeout_ms = 1000;
    config.groups = vec![
        GroupConfig::new(format!("test_grupo1_{}", std::process::id()), StartPolicy::Earliest),
        GroupConfig::new(format!("test_grupo2_{}", std::process::id()), StartPolicy::Latest),
    ];
    config
}

pub fn avro_codec() -> Arc<dyn RecordCodec<Course>> {
    Arc::new(AvroCodec::<Course, _>::new(InMemorySchemaRegistry::new()).unwrap())
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Collects `(group, description)` for every record handed to its handlers.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<(String, String)>>>,
}

impl Recorder {
    pub fn handler(&self) -> Box<dyn RecordHandler> {
        let seen = Arc::clone(&self.seen);
        Box::new(move |group: &str, delivery: &Delivery| -> txn_pubsub::Result<()> {
            seen.lock()
                .unwrap()
                .push((group.to_string(), delivery.envelope.value.description.clone()));
            Ok(())
        })
    }

    pub fn descriptions(&self, group: &str) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(g, _)| g == group)
            .map(|(_, description)| description.clone())
            .collect()
    }
}
