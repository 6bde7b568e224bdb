//! rdkafka-backed implementations of the broker seams.

pub mod consumer;
pub mod dead_letter;
pub mod producer;


use crate::broker::BrokerClients;
use crate::config::{Config, GroupConfig};
use crate::Result;

pub use consumer::KafkaConsumer;
pub use dead_letter::KafkaDeadLetterSink;
pub use producer::KafkaProducer;

/// Opens real Kafka clients from the configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaClients;

impl BrokerClients for KafkaClients {
    type Producer = KafkaProducer;
    type Consumer = KafkaConsumer;
    type DeadLetter = KafkaDeadLetterSink;

    fn producer(&self, config: &Config) -> Result<Self::Producer> {
        KafkaProducer::new(config)
    }

    fn consumer(&self, config: &Config, group: &GroupConfig) -> Result<Self::Consumer> {
        KafkaConsumer::new(config, group)
    }

    fn dead_letter(&self, config: &Config, _group: &GroupConfig) -> Result<Self::DeadLetter> {
        KafkaDeadLetterSink::new(config)
    }
}
