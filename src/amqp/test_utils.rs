//! In-memory [`Channel`] and [`EventLoop`] doubles.
//!
//! Both halves share one [`MockBroker`]. Acknowledgements are queued when an
//! operation is issued and only resolved when the loop is pumped, the same
//! way a real session only hears back from the broker while its loop runs.

use super::{AckSender, Channel, EventLoop, ExchangeKind, PendingAck};
use bytes::Bytes;
use std::cell::RefCell;
use std::rc::Rc;

/// A message recorded by [`MockChannel::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
}

/// How the mock broker answers transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitReply {
    Ok,
    Error(String),
    /// Never answers.
    Silent,
}

#[derive(Debug)]
pub struct MockBroker {
    /// Loop iterations needed before the connection reports ready.
    pub ready_after: usize,
    pub exchanges: Vec<String>,
    /// When false, exchange declarations are never answered.
    pub answer_declares: bool,
    pub commit_reply: CommitReply,
    pub published: Vec<PublishedMessage>,
    /// Published messages already pushed out by the last pump.
    pub flushed: usize,
    pub pumps: usize,
    pub declares: Vec<(String, ExchangeKind, bool)>,
    pub transactions_started: usize,
    pub commits: usize,
    pub closed: bool,
    pub stopped: bool,
    queued: Vec<(AckSender, Result<(), String>)>,
    held: Vec<AckSender>,
}

impl MockBroker {
    /// A broker that is ready immediately and knows `exchange`.
    pub fn with_exchange(exchange: &str) -> Self {
        Self {
            ready_after: 0,
            exchanges: vec![exchange.to_string()],
            answer_declares: true,
            commit_reply: CommitReply::Ok,
            published: Vec::new(),
            flushed: 0,
            pumps: 0,
            declares: Vec::new(),
            transactions_started: 0,
            commits: 0,
            closed: false,
            stopped: false,
            queued: Vec::new(),
            held: Vec::new(),
        }
    }

    /// Splits the broker into the two capabilities a producer consumes.
    pub fn split(self) -> (Rc<RefCell<MockBroker>>, MockChannel, MockLoop) {
        let shared = Rc::new(RefCell::new(self));
        (
            shared.clone(),
            MockChannel {
                broker: shared.clone(),
            },
            MockLoop { broker: shared },
        )
    }

    fn pump(&mut self) {
        self.pumps += 1;
        self.flushed = self.published.len();
        for (ack, result) in self.queued.drain(..) {
            ack.resolve(result);
        }
    }

    /// Acknowledgements the broker is sitting on.
    pub fn unanswered(&self) -> usize {
        self.held.len()
    }

    pub fn routing_keys(&self) -> Vec<&str> {
        self.published.iter().map(|m| m.routing_key.as_str()).collect()
    }
}

pub struct MockChannel {
    broker: Rc<RefCell<MockBroker>>,
}

impl Channel for MockChannel {
    fn is_ready(&self) -> bool {
        let broker = self.broker.borrow();
        broker.pumps >= broker.ready_after
    }

    fn publish(&mut self, exchange: &str, routing_key: &str, payload: Bytes) {
        self.broker.borrow_mut().published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
        });
    }

    fn declare_exchange(&mut self, name: &str, kind: ExchangeKind, passive: bool) -> PendingAck {
        let mut broker = self.broker.borrow_mut();
        broker.declares.push((name.to_string(), kind, passive));

        let result = if broker.exchanges.iter().any(|e| e == name) {
            Ok(())
        } else if passive {
            Err(format!("NOT_FOUND - no exchange '{}' in vhost '/'", name))
        } else {
            broker.exchanges.push(name.to_string());
            Ok(())
        };

        let (ack, pending) = PendingAck::pair();
        if broker.answer_declares {
            broker.queued.push((ack, result));
        } else {
            broker.held.push(ack);
        }
        pending
    }

    fn start_transaction(&mut self) {
        self.broker.borrow_mut().transactions_started += 1;
    }

    fn commit_transaction(&mut self) -> PendingAck {
        let mut broker = self.broker.borrow_mut();
        broker.commits += 1;

        let (ack, pending) = PendingAck::pair();
        match broker.commit_reply.clone() {
            CommitReply::Ok => broker.queued.push((ack, Ok(()))),
            CommitReply::Error(reason) => broker.queued.push((ack, Err(reason))),
            CommitReply::Silent => broker.held.push(ack),
        }
        pending
    }

    fn close(&mut self) {
        self.broker.borrow_mut().closed = true;
    }
}

pub struct MockLoop {
    broker: Rc<RefCell<MockBroker>>,
}

impl EventLoop for MockLoop {
    fn run_non_blocking(&mut self) {
        self.broker.borrow_mut().pump();
    }

    fn run_once(&mut self) {
        self.broker.borrow_mut().pump();
    }

    fn stop(&mut self) {
        self.broker.borrow_mut().stopped = true;
    }
}
