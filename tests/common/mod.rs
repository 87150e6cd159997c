#![allow(dead_code)]

use amqp_row_producer::amqp::test_utils::{MockBroker, MockChannel, MockLoop};
use amqp_row_producer::{Producer, ProducerConfig};
use std::cell::RefCell;
use std::env;
use std::rc::Rc;

/// Configuration for tests that need nothing but the in-memory broker.
pub fn mock_config() -> ProducerConfig {
    let mut config = ProducerConfig::new("localhost", "rows");
    config.connection_setup_sleep_ms = 0;
    config.loop_wait_ms = 0;
    config
}

pub fn mock_producer(
    config: ProducerConfig,
) -> (Rc<RefCell<MockBroker>>, Producer<MockChannel, MockLoop>) {
    let (broker, channel, event_loop) = MockBroker::with_exchange(&config.exchange_name()).split();
    let producer = Producer::new(config, channel, event_loop).expect("valid test config");
    (broker, producer)
}

/// Get broker configuration from environment variables
pub fn get_test_config() -> ProducerConfig {
    // Use TEST_ prefix for test environment variables
    let mut config = ProducerConfig::new(
        env::var("TEST_AMQP_HOST").unwrap_or_else(|_| "localhost".to_string()),
        format!("test_{}", std::process::id()),
    );
    config.port = env::var("TEST_AMQP_PORT")
        .unwrap_or_else(|_| "5672".to_string())
        .parse()
        .unwrap_or(5672);
    config.username = env::var("TEST_AMQP_USERNAME").unwrap_or_else(|_| "guest".to_string());
    config.password = env::var("TEST_AMQP_PASSWORD").unwrap_or_else(|_| "guest".to_string());
    config.connection_setup_sleep_ms = 50;
    config.loop_retries_max = 100; // Fail fast when no broker is around
    config
}
