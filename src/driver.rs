//! Wires one publisher and one subscriber per configured group.
//!
//! Subscribers run as independent tasks from startup until shutdown. Each
//! trigger received on the channel publishes the next record; the driver
//! never waits for a subscriber to see it.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::BrokerClients;
use crate::codec::RecordCodec;
use crate::config::{Config, GroupConfig};
use crate::publisher::{PublishOutcome, TransactionalPublisher};
use crate::record::Course;
use crate::subscriber::{LogHandler, OffsetTrackedSubscriber, RecordHandler, SubscriberStats};
use crate::{Error, Result};

/// Builds the record handler for a group.
pub type HandlerFactory = Arc<dyn Fn(&GroupConfig) -> Box<dyn RecordHandler> + Send + Sync>;

#[derive(Debug)]
pub struct GroupReport {
    pub group: String,
    pub result: Result<SubscriberStats>,
}

#[derive(Debug, Default)]
pub struct DriverReport {
    pub published: u64,
    pub failed: u64,
    pub groups: Vec<GroupReport>,
}

pub struct Driver<B> {
    config: Config,
    clients: B,
    codec: Arc<dyn RecordCodec<Course>>,
    handlers: HandlerFactory,
}

impl<B: BrokerClients> Driver<B> {
    pub fn new(config: Config, clients: B, codec: Arc<dyn RecordCodec<Course>>) -> Self {
        Self {
            config,
            clients,
            codec,
            handlers: Arc::new(|_: &GroupConfig| Box::new(LogHandler) as Box<dyn RecordHandler>),
        }
    }

    pub fn with_handlers(mut self, handlers: HandlerFactory) -> Self {
        self.handlers = handlers;
        self
    }

    /// Runs until `shutdown` fires or the trigger channel closes.
    ///
    /// A publisher failure that leaves it unusable ends the run with that
    /// error, after the subscribers were stopped. Subscriber failures are
    /// reported per group and do not stop the driver.
    pub async fn run(
        self,
        mut triggers: mpsc::Receiver<()>,
        shutdown: CancellationToken,
    ) -> Result<DriverReport> {
        let producer = self.clients.producer(&self.config)?;
        let mut subscribers = Vec::with_capacity(self.config.groups.len());
        for group in &self.config.groups {
            let consumer = self.clients.consumer(&self.config, group)?;
            let dead_letter = self.clients.dead_letter(&self.config, group)?;
            subscribers.push(
                OffsetTrackedSubscriber::new(
                    group.clone(),
                    consumer,
                    dead_letter,
                    Arc::clone(&self.codec),
                    &self.config,
                )
                .with_handler((self.handlers)(group)),
            );
        }

        let stop_subscribers = shutdown.child_token();
        let handles: Vec<(String, JoinHandle<Result<SubscriberStats>>)> = subscribers
            .into_iter()
            .map(|subscriber| {
                let group = subscriber.group().id.clone();
                let handle = tokio::spawn(subscriber.run(stop_subscribers.clone()));
                (group, handle)
            })
            .collect();

        let mut publisher = TransactionalPublisher::new(
            producer,
            Arc::clone(&self.codec),
            self.config.broker.topic.clone(),
            self.config.publisher.clone(),
        );

        let mut report = DriverReport::default();
        let mut fatal = None;
        let mut index = 1u64;
        info!(topic = %self.config.broker.topic, groups = handles.len(), "Driver started");

        loop {
            let trigger = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                trigger = triggers.recv() => trigger,
            };
            if trigger.is_none() {
                break;
            }

            match publisher.publish(index, &shutdown).await {
                Ok(PublishOutcome::Persisted { .. }) => report.published += 1,
                Ok(PublishOutcome::Failed { reason, .. }) => {
                    warn!(index, %reason, "Message was not published");
                    report.failed += 1;
                }
                Err(e) => {
                    error!(index, error = %e, "Publisher stopped");
                    fatal = Some(e);
                    break;
                }
            }
            index += 1;
        }

        if let Err(e) = publisher.close().await {
            error!(error = %e, "Failed to close publisher");
        }

        stop_subscribers.cancel();
        let (groups, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let joined = futures::future::join_all(handles).await;
        for (group, joined) in groups.into_iter().zip(joined) {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(Error::InvalidState {
                    message: format!("subscriber task for '{}' failed: {}", group, e),
                }),
            };
            if let Err(e) = &result {
                warn!(group = %group, error = %e, "Subscriber ended with an error");
            }
            report.groups.push(GroupReport { group, result });
        }

        info!(
            published = report.published,
            failed = report.failed,
            "Driver stopped"
        );
        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::broker::TopicPartition;
    use crate::codec::JsonCodec;
    use crate::config::IsolationLevel;
    use std::time::Duration;

    fn config() -> Config {
        let mut config = Config::default();
        config.subscriber.poll_timeout_ms = 50;
        config
    }

    #[tokio::test]
    async fn test_publishes_per_trigger_and_stops_on_close() {
        let broker = InMemoryBroker::new();
        let config = config();
        let driver = Driver::new(config.clone(), broker.clone(), Arc::new(JsonCodec));

        let (tx, rx) = mpsc::channel(4);
        for _ in 0..3 {
            tx.send(()).await.unwrap();
        }
        drop(tx);

        let report = driver.run(rx, CancellationToken::new()).await.unwrap();
        assert_eq!(report.published, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.groups.len(), 2);
        assert!(report.groups.iter().all(|g| g.result.is_ok()));
        assert_eq!(
            broker
                .visible_records(&config.broker.topic, IsolationLevel::ReadCommitted)
                .len(),
            3
        );
        assert_eq!(broker.closed_consumers("grupo1"), 1);
        assert_eq!(broker.closed_consumers("grupo2"), 1);
    }

    #[tokio::test]
    async fn test_init_timeout_stops_driver() {
        let broker = InMemoryBroker::new();
        broker.fail_next_inits(1);
        let driver = Driver::new(config(), broker.clone(), Arc::new(JsonCodec));

        let (tx, rx) = mpsc::channel(1);
        tx.send(()).await.unwrap();

        let result = driver.run(rx, CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(broker.closed_consumers("grupo1"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_without_triggers() {
        let broker = InMemoryBroker::new();
        let config = config();
        let driver = Driver::new(config.clone(), broker.clone(), Arc::new(JsonCodec));
        let (_tx, rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        let report = driver.run(rx, shutdown).await.unwrap();
        assert_eq!(report.published, 0);
        let tp = TopicPartition::new(config.broker.topic.clone(), 0);
        assert_eq!(broker.committed_offset("grupo1", &tp), None);
    }
}
