//! Broker-facing capabilities consumed by the [`Producer`](crate::Producer).
//!
//! The producer never talks to a network library directly. It drives two
//! capabilities from its own thread:
//!
//! * a [`Channel`], the asynchronous protocol session over one connection;
//! * an [`EventLoop`], the single-threaded loop that only makes progress
//!   while the calling thread pumps it.
//!
//! Operations that the broker confirms hand back a [`PendingAck`], a one-shot
//! result cell resolved while the loop is being pumped.

pub mod ack;
pub mod event_loop;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use ack::{AckSender, PendingAck};
pub use event_loop::TokioLoop;
pub use session::LapinChannel;

use bytes::Bytes;

/// Exchange types understood by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// An asynchronous broker session over a single connection.
///
/// Fire-and-forget operations only enqueue work; nothing is guaranteed to
/// reach the network until the owning [`EventLoop`] is pumped.
pub trait Channel {
    /// True once the connection is established and the channel is open.
    fn is_ready(&self) -> bool;

    fn publish(&mut self, exchange: &str, routing_key: &str, payload: Bytes);

    /// With `passive` set, only checks that the exchange exists.
    fn declare_exchange(&mut self, name: &str, kind: ExchangeKind, passive: bool) -> PendingAck;

    fn start_transaction(&mut self);

    fn commit_transaction(&mut self) -> PendingAck;

    fn close(&mut self);
}

/// A cooperative event loop driven by the thread that owns it.
pub trait EventLoop {
    /// Runs whatever is ready right now and returns without waiting.
    fn run_non_blocking(&mut self);

    /// Runs a single blocking iteration.
    fn run_once(&mut self);

    /// Stops the loop. Pending work is abandoned.
    fn stop(&mut self);
}
