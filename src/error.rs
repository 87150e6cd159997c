//! Error types and result handling for amqp-row-producer.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Most broker-side failures never reach the caller of
//! [`Producer::write`](std::io::Write::write) or
//! [`Producer::end_row`](crate::Producer::end_row): they are logged and the
//! producer keeps accepting rows. The lifecycle operations
//! ([`check_exchange`](crate::Producer::check_exchange),
//! [`finalize`](crate::Producer::finalize) and
//! [`shutdown`](crate::Producer::shutdown)) return them so callers can
//! observe the outcome if they care to.
//!
//! # Example
//!
//! ```rust
//! use amqp_row_producer::{Error, Result};
//!
//! fn declare() -> Result<()> {
//!     Err(Error::ExchangeNotFound {
//!         exchange: "events_direct".to_string(),
//!         reason: "NOT_FOUND".to_string(),
//!     })
//! }
//!
//! match declare() {
//!     Ok(()) => println!("Exchange exists"),
//!     Err(Error::ExchangeNotFound { exchange, .. }) => eprintln!("Missing {}", exchange),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for amqp-row-producer operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded from file or environment.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but holds values the producer cannot work with.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error, typically from building the event loop or reading input.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection did not report ready within the retry ceiling.
    #[error("Connection not ready after {attempts} attempts")]
    ConnectionSetup {
        /// Number of readiness polls performed
        attempts: usize,
    },

    /// Passive declaration of the target exchange was rejected.
    #[error("Exchange '{exchange}' was not declared: {reason}")]
    ExchangeNotFound {
        /// Full exchange name, suffix included
        exchange: String,
        /// Reason reported by the broker
        reason: String,
    },

    /// The broker rejected the transaction commit.
    #[error("Transaction commit failed: {reason}")]
    TransactionCommit {
        /// Reason reported by the broker
        reason: String,
    },

    /// A bounded wait ran out before an acknowledgement arrived.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },
}

/// A convenient Result type alias for amqp-row-producer operations.
///
/// This is equivalent to `std::result::Result<T, amqp_row_producer::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
