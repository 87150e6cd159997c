//! The batching producer.
//!
//! [`Producer`] is a byte sink: callers write serialized rows through
//! [`std::io::Write`] and mark each row boundary with
//! [`end_row`](Producer::end_row). Every `rows_per_message` rows the buffered
//! bytes become one message, published to the configured exchange over the
//! producer's own connection.
//!
//! The broker client may keep its own I/O thread, but the producer's session
//! commands and acknowledgements only advance while the producer pumps its
//! event loop, which happens
//!
//! * while waiting for the connection during construction,
//! * every `batch` messages, through an exchange check,
//! * on [`finalize`](Producer::finalize) and [`shutdown`](Producer::shutdown).
//!
//! Published messages are not acknowledged one by one. A crash between two
//! checkpoints can lose whatever was published since the last one.
//!
//! # Example
//!
//! ```rust,no_run
//! use amqp_row_producer::{Producer, ProducerConfig};
//! use std::io::Write;
//!
//! # fn main() -> amqp_row_producer::Result<()> {
//! let mut config = ProducerConfig::new("localhost", "events");
//! config.delimiter = Some('\n');
//! config.rows_per_message = 100;
//!
//! let mut producer = Producer::connect(config)?;
//! for i in 0..1000 {
//!     writeln!(producer, "row {}", i)?;
//!     producer.end_row();
//! }
//! producer.shutdown()?;
//! # Ok(())
//! # }
//! ```

use crate::amqp::{Channel, EventLoop, ExchangeKind, LapinChannel, TokioLoop};
use crate::buffer::ChunkedRowBuffer;
use crate::{Error, ProducerConfig, Result};
use bytes::Bytes;
use std::borrow::Cow;
use std::io;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

/// A producer over a lapin connection driven by a current-thread runtime.
pub type AmqpProducer = Producer<LapinChannel, TokioLoop>;

pub struct Producer<C: Channel, L: EventLoop> {
    config: ProducerConfig,
    exchange_name: String,
    buffer: ChunkedRowBuffer,
    channel: C,
    event_loop: L,
    next_queue: usize,
    message_counter: usize,
    messages_published: u64,
    shut_down: bool,
}

impl Producer<LapinChannel, TokioLoop> {
    /// Opens a dedicated connection and channel for a new producer.
    ///
    /// Only an invalid configuration or a failure to build the event loop is
    /// returned as an error. A broker that cannot be reached is logged and
    /// the producer is returned anyway; its publishes will fail quietly.
    #[instrument(skip(config), fields(host = %config.host, port = config.port))]
    pub fn connect(config: ProducerConfig) -> Result<Self> {
        config.validate()?;

        let event_loop = TokioLoop::new(config.loop_wait())?;
        let channel = LapinChannel::open(event_loop.handle(), config.amqp_uri());

        Self::new(config, channel, event_loop)
    }
}

impl<C: Channel, L: EventLoop> Producer<C, L> {
    /// Builds a producer over an already created channel and loop.
    ///
    /// Waits for the channel to report ready, pumping the loop between
    /// polls, checks that the exchange exists and, in transactional mode,
    /// starts a transaction.
    pub fn new(config: ProducerConfig, channel: C, event_loop: L) -> Result<Self> {
        config.validate()?;

        let buffer = ChunkedRowBuffer::new(
            config.rows_per_message,
            config.chunk_size,
            config.delimiter_byte(),
        );

        let mut producer = Self {
            exchange_name: config.exchange_name(),
            config,
            buffer,
            channel,
            event_loop,
            next_queue: 0,
            message_counter: 0,
            messages_published: 0,
            shut_down: false,
        };

        if let Err(e) = producer.wait_until_ready() {
            error!("Cannot set up connection for producer: {}", e);
        }

        // Failure is already logged.
        let _ = producer.check_exchange();

        if producer.config.transactional {
            debug!("Starting transaction on producer channel");
            producer.channel.start_transaction();
        }

        Ok(producer)
    }

    fn wait_until_ready(&mut self) -> Result<()> {
        let mut attempts = 0;
        while !self.channel.is_ready() {
            attempts += 1;
            if attempts >= self.config.loop_retries_max {
                return Err(Error::ConnectionSetup { attempts });
            }
            self.event_loop.run_non_blocking();
            thread::sleep(self.config.connection_setup_sleep());
        }

        debug!(attempts, "Producer connection ready");
        Ok(())
    }

    /// Marks the end of the row written since the previous boundary.
    ///
    /// Publishes a message when this row completes a batch.
    pub fn end_row(&mut self) {
        if let Some(payload) = self.buffer.count_row() {
            self.publish_batch(payload);
        }
    }

    /// Writes one complete row and marks its boundary.
    pub fn write_row(&mut self, row: &[u8]) {
        self.buffer.write(row);
        self.end_row();
    }

    /// Publishes whatever is buffered even though the batch is incomplete.
    ///
    /// Teardown never does this on its own. Returns false when nothing was
    /// pending.
    pub fn flush_pending(&mut self) -> bool {
        match self.buffer.flush_pending() {
            Some(payload) => {
                debug!(bytes = payload.len(), "Flushing partial batch");
                self.publish_batch(payload);
                true
            }
            None => false,
        }
    }

    /// Publishes one message payload, fire-and-forget.
    ///
    /// The message is only queued on the channel; it goes out the next time
    /// the loop is pumped. Every `batch` messages an exchange check pumps
    /// the loop.
    pub fn publish_batch(&mut self, payload: Bytes) {
        self.next_queue = self.next_queue % self.config.num_queues + 1;

        let routing_key: Cow<'_, str> = if self.config.bind_by_id {
            Cow::Owned(self.next_queue.to_string())
        } else {
            Cow::Borrowed(&self.config.routing_key)
        };

        trace!(
            exchange = %self.exchange_name,
            routing_key = %routing_key,
            bytes = payload.len(),
            "Publishing message"
        );
        self.channel.publish(&self.exchange_name, &routing_key, payload);
        self.messages_published += 1;

        self.message_counter = (self.message_counter + 1) % self.config.batch;
        if self.message_counter == 0 {
            debug!(
                messages = self.messages_published,
                "Batch checkpoint, pumping event loop"
            );
            let _ = self.check_exchange();
        }
    }

    /// Checks that the exchange exists, pumping the loop until the broker
    /// answers.
    ///
    /// Doubles as the way to push queued publishes onto the network. Without
    /// `exchange_check_timeout_ms` the wait has no bound.
    #[instrument(skip(self), fields(exchange = %self.exchange_name))]
    pub fn check_exchange(&mut self) -> Result<()> {
        let mut ack = self
            .channel
            .declare_exchange(&self.exchange_name, ExchangeKind::Direct, true);
        let deadline = self
            .config
            .exchange_check_timeout()
            .map(|timeout| Instant::now() + timeout);

        loop {
            if let Some(outcome) = ack.poll() {
                return match outcome {
                    Ok(()) => {
                        trace!("Exchange exists");
                        Ok(())
                    }
                    Err(reason) => {
                        error!("Exchange for producer was not declared. Reason: {}", reason);
                        Err(Error::ExchangeNotFound {
                            exchange: self.exchange_name.clone(),
                            reason,
                        })
                    }
                };
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    warn!("Exchange check was not answered in time");
                    return Err(Error::Timeout {
                        message: format!("exchange check for '{}'", self.exchange_name),
                    });
                }
            }

            self.event_loop.run_once();
        }
    }

    /// Runs a last exchange check and, in transactional mode, commits.
    ///
    /// The commit wait is bounded by `loop_retries_max` iterations of
    /// `loop_wait_ms`. An error is returned for the caller's information
    /// only: messages already published are neither retried nor rolled back.
    #[instrument(skip(self), fields(exchange = %self.exchange_name))]
    pub fn finalize(&mut self) -> Result<()> {
        let exchange = self.check_exchange();

        if !self.config.transactional {
            return exchange;
        }

        let commit = self.wait_for_commit();
        exchange.and(commit)
    }

    fn wait_for_commit(&mut self) -> Result<()> {
        let mut ack = self.channel.commit_transaction();
        let mut attempts = 0;

        loop {
            if let Some(outcome) = ack.poll() {
                return match outcome {
                    Ok(()) => {
                        trace!("All messages were successfully published");
                        Ok(())
                    }
                    Err(reason) => {
                        warn!("None of messages were published: {}", reason);
                        Err(Error::TransactionCommit { reason })
                    }
                };
            }

            attempts += 1;
            if attempts >= self.config.loop_retries_max {
                error!(attempts, "Transaction commit was not acknowledged");
                return Err(Error::Timeout {
                    message: format!("transaction commit after {} attempts", attempts),
                });
            }

            self.event_loop.run_once();
            thread::sleep(self.config.loop_wait());
        }
    }

    /// Finalizes, closes the connection and stops the event loop.
    ///
    /// Every row must have been published by now: the row count has to be a
    /// multiple of `rows_per_message`, or [`flush_pending`](Self::flush_pending)
    /// must have been called. A pending partial batch is a caller bug; it
    /// fails a debug assertion and is logged in release builds.
    pub fn shutdown(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let result = self.finalize();

        self.channel.close();
        // One more iteration so the close goes out.
        self.event_loop.run_once();
        self.event_loop.stop();

        info!(
            exchange = %self.exchange_name,
            messages = self.messages_published,
            "Producer shut down"
        );

        if !self.buffer.is_empty() {
            error!(
                rows = self.buffer.rows(),
                chunks = self.buffer.chunk_count(),
                "Producer torn down with a partial batch pending"
            );
            if !thread::panicking() {
                debug_assert!(
                    self.buffer.is_empty(),
                    "partial batch pending at teardown: row count must be a multiple of rows_per_message"
                );
            }
        }

        result
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// Rows buffered towards the next message.
    pub fn rows(&self) -> usize {
        self.buffer.rows()
    }

    /// True when no row is waiting for its batch to complete.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Messages handed to the channel so far.
    pub fn messages_published(&self) -> u64 {
        self.messages_published
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }
}

impl<C: Channel, L: EventLoop> io::Write for Producer<C, L> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.write(buf);
        Ok(buf.len())
    }

    /// Rows are only published on row boundaries; there is nothing to flush.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<C: Channel, L: EventLoop> Drop for Producer<C, L> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            debug!("Producer teardown finished with error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::test_utils::{CommitReply, MockBroker, MockChannel, MockLoop};
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;

    fn test_config() -> ProducerConfig {
        let mut config = ProducerConfig::new("localhost", "events");
        config.routing_key = "rows".to_string();
        config.connection_setup_sleep_ms = 0;
        config.loop_wait_ms = 0;
        config
    }

    fn start(
        config: ProducerConfig,
        broker: MockBroker,
    ) -> (Rc<RefCell<MockBroker>>, Producer<MockChannel, MockLoop>) {
        let (shared, channel, event_loop) = broker.split();
        let producer = Producer::new(config, channel, event_loop).unwrap();
        (shared, producer)
    }

    fn payloads(broker: &Rc<RefCell<MockBroker>>) -> Vec<Vec<u8>> {
        broker
            .borrow()
            .published
            .iter()
            .map(|m| m.payload.to_vec())
            .collect()
    }

    #[test]
    fn test_two_rows_per_message() {
        let mut config = test_config();
        config.rows_per_message = 2;
        config.delimiter = Some(';');
        let (broker, mut producer) = start(config, MockBroker::with_exchange("events_direct"));

        for row in ["a;", "b;", "c;", "d;"] {
            producer.write_all(row.as_bytes()).unwrap();
            producer.end_row();
        }

        assert_eq!(payloads(&broker), vec![b"a;b".to_vec(), b"c;d".to_vec()]);
        let published = broker.borrow().published.clone();
        assert!(published.iter().all(|m| m.exchange == "events_direct"));
        assert!(published.iter().all(|m| m.routing_key == "rows"));
        assert!(producer.is_empty());

        producer.shutdown().unwrap();
    }

    #[test]
    fn test_routing_by_id_rotates_queues() {
        let mut config = test_config();
        config.bind_by_id = true;
        config.num_queues = 3;
        let (broker, mut producer) = start(config, MockBroker::with_exchange("events_direct"));

        for i in 0..7 {
            producer.write_row(format!("payload {}", i * 17).as_bytes());
        }

        assert_eq!(
            broker.borrow().routing_keys(),
            vec!["1", "2", "3", "1", "2", "3", "1"]
        );
        producer.shutdown().unwrap();
    }

    #[test]
    fn test_messages_published_in_row_order() {
        let (broker, mut producer) = start(test_config(), MockBroker::with_exchange("events_direct"));

        for i in 0..50 {
            producer.write_row(format!("{}", i).as_bytes());
        }

        let expected: Vec<Vec<u8>> = (0..50).map(|i| format!("{}", i).into_bytes()).collect();
        assert_eq!(payloads(&broker), expected);
        assert_eq!(producer.messages_published(), 50);
        producer.shutdown().unwrap();
    }

    #[test]
    fn test_batch_checkpoint_pumps_loop() {
        let mut config = test_config();
        config.batch = 3;
        let (broker, mut producer) = start(config, MockBroker::with_exchange("events_direct"));

        // One declaration from construction.
        assert_eq!(broker.borrow().declares.len(), 1);

        for i in 0..7 {
            producer.write_row(format!("m{}", i).as_bytes());
        }

        {
            let broker = broker.borrow();
            assert_eq!(broker.declares.len(), 3);
            assert_eq!(broker.flushed, 6);
            assert!(broker
                .declares
                .iter()
                .all(|(name, kind, passive)| name == "events_direct"
                    && *kind == ExchangeKind::Direct
                    && *passive));
        }

        producer.shutdown().unwrap();
        assert_eq!(broker.borrow().flushed, 7);
    }

    #[test]
    fn test_waits_for_connection_ready() {
        let mut broker = MockBroker::with_exchange("events_direct");
        broker.ready_after = 3;
        let (broker, producer) = start(test_config(), broker);

        // Three readiness pumps, one more for the exchange check.
        assert_eq!(broker.borrow().pumps, 4);
        producer.shutdown().unwrap();
    }

    #[test]
    fn test_connection_setup_gives_up_after_ceiling() {
        let mut config = test_config();
        config.loop_retries_max = 5;
        let mut broker = MockBroker::with_exchange("events_direct");
        broker.ready_after = usize::MAX;

        let (broker, producer) = start(config, broker);

        // Four readiness pumps before giving up, then the exchange check.
        assert_eq!(broker.borrow().pumps, 5);
        assert_eq!(broker.borrow().declares.len(), 1);
        producer.shutdown().unwrap();
    }

    #[test]
    fn test_missing_exchange_reports_error() {
        let (broker, mut producer) = start(test_config(), MockBroker::with_exchange("other_direct"));

        match producer.check_exchange() {
            Err(Error::ExchangeNotFound { exchange, reason }) => {
                assert_eq!(exchange, "events_direct");
                assert!(reason.contains("NOT_FOUND"));
            }
            other => panic!("expected ExchangeNotFound, got {:?}", other),
        }
        assert_eq!(broker.borrow().declares.len(), 2);

        assert!(matches!(
            producer.shutdown(),
            Err(Error::ExchangeNotFound { .. })
        ));
    }

    #[test]
    fn test_existing_exchange_check_succeeds() {
        let (_broker, mut producer) =
            start(test_config(), MockBroker::with_exchange("events_direct"));

        assert!(producer.check_exchange().is_ok());
        producer.shutdown().unwrap();
    }

    #[test]
    fn test_exchange_check_timeout() {
        let mut config = test_config();
        config.exchange_check_timeout_ms = Some(0);
        let mut broker = MockBroker::with_exchange("events_direct");
        broker.answer_declares = false;

        let (broker, mut producer) = start(config, broker);

        assert!(matches!(
            producer.check_exchange(),
            Err(Error::Timeout { .. })
        ));
        assert_eq!(broker.borrow().unanswered(), 2);
        assert!(producer.shutdown().is_err());
    }

    #[test]
    fn test_transaction_started_and_committed() {
        let mut config = test_config();
        config.transactional = true;
        let (broker, mut producer) = start(config, MockBroker::with_exchange("events_direct"));

        assert_eq!(broker.borrow().transactions_started, 1);

        producer.write_row(b"only row");
        producer.shutdown().unwrap();

        let broker = broker.borrow();
        assert_eq!(broker.commits, 1);
        assert_eq!(broker.flushed, 1);
    }

    #[test]
    fn test_commit_rejected() {
        let mut config = test_config();
        config.transactional = true;
        let mut broker = MockBroker::with_exchange("events_direct");
        broker.commit_reply = CommitReply::Error("PRECONDITION_FAILED".to_string());

        let (_broker, producer) = start(config, broker);

        match producer.shutdown() {
            Err(Error::TransactionCommit { reason }) => assert_eq!(reason, "PRECONDITION_FAILED"),
            other => panic!("expected TransactionCommit, got {:?}", other),
        }
    }

    #[test]
    fn test_unanswered_commit_gives_up_after_ceiling() {
        let mut config = test_config();
        config.transactional = true;
        config.loop_retries_max = 10;
        let mut broker = MockBroker::with_exchange("events_direct");
        broker.commit_reply = CommitReply::Silent;

        let (broker, mut producer) = start(config, broker);
        let pumps_before = broker.borrow().pumps;

        assert!(matches!(producer.finalize(), Err(Error::Timeout { .. })));

        // One pump for the exchange check, nine while waiting on the commit.
        assert_eq!(broker.borrow().pumps - pumps_before, 10);
        assert_eq!(broker.borrow().unanswered(), 1);
    }

    #[test]
    fn test_non_transactional_never_commits() {
        let (broker, producer) = start(test_config(), MockBroker::with_exchange("events_direct"));
        producer.shutdown().unwrap();

        let broker = broker.borrow();
        assert_eq!(broker.transactions_started, 0);
        assert_eq!(broker.commits, 0);
    }

    #[test]
    fn test_shutdown_closes_then_stops_once() {
        let (broker, producer) = start(test_config(), MockBroker::with_exchange("events_direct"));
        producer.shutdown().unwrap();

        let broker = broker.borrow();
        assert!(broker.closed);
        assert!(broker.stopped);
        // Construction and finalize; drop after shutdown does not run again.
        assert_eq!(broker.declares.len(), 2);
    }

    #[test]
    fn test_drop_tears_down() {
        let (broker, producer) = start(test_config(), MockBroker::with_exchange("events_direct"));
        drop(producer);

        let broker = broker.borrow();
        assert!(broker.closed);
        assert!(broker.stopped);
    }

    #[test]
    fn test_flush_pending_publishes_partial_batch() {
        let mut config = test_config();
        config.rows_per_message = 10;
        config.delimiter = Some('\n');
        let (broker, mut producer) = start(config, MockBroker::with_exchange("events_direct"));

        producer.write_row(b"one\n");
        producer.write_row(b"two\n");
        assert_eq!(producer.rows(), 2);
        assert!(broker.borrow().published.is_empty());

        assert!(producer.flush_pending());
        assert!(!producer.flush_pending());
        assert_eq!(payloads(&broker), vec![b"one\ntwo".to_vec()]);

        producer.shutdown().unwrap();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "partial batch pending at teardown")]
    fn test_partial_batch_at_teardown_is_a_bug() {
        let mut config = test_config();
        config.rows_per_message = 3;
        let (_broker, mut producer) = start(config, MockBroker::with_exchange("events_direct"));

        producer.write_row(b"lonely");
        let _ = producer.shutdown();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.num_queues = 0;
        let (_shared, channel, event_loop) = MockBroker::with_exchange("events_direct").split();

        assert!(matches!(
            Producer::new(config, channel, event_loop),
            Err(Error::InvalidConfig(_))
        ));
    }
}
