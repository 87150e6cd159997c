pub mod amqp;
pub mod buffer;
pub mod config;
pub mod error;
pub mod producer;

pub use config::ProducerConfig;
pub use error::{Error, Result};
pub use producer::{AmqpProducer, Producer};
