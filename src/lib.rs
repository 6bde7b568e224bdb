pub mod broker;
pub mod codec;
pub mod config;
pub mod dead_letter;
pub mod driver;
pub mod error;
pub mod position;
pub mod publisher;
pub mod record;
pub mod retry;
pub mod subscriber;

pub mod kafka;

pub use config::Config;
pub use driver::{Driver, DriverReport};
pub use error::{Error, Result};
pub use publisher::{PublishOutcome, TransactionalPublisher};
pub use subscriber::{OffsetTrackedSubscriber, RecordHandler};
