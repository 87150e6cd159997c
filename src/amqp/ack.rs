use tokio::sync::oneshot::{self, error::TryRecvError};

type AckResult = std::result::Result<(), String>;

/// Resolving half of a [`PendingAck`], held by whoever observes the broker
/// reply.
#[derive(Debug)]
pub struct AckSender {
    tx: oneshot::Sender<AckResult>,
}

impl AckSender {
    pub fn succeed(self) {
        self.resolve(Ok(()));
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.resolve(Err(reason.into()));
    }

    pub fn resolve(self, result: AckResult) {
        // The waiting side may have given up already.
        let _ = self.tx.send(result);
    }
}

/// A broker acknowledgement that has not necessarily arrived yet.
///
/// Resolved at most once; after that [`poll`](PendingAck::poll) keeps
/// returning the same outcome. A sender dropped without resolving counts as
/// a failure.
#[derive(Debug)]
pub struct PendingAck {
    rx: oneshot::Receiver<AckResult>,
    outcome: Option<AckResult>,
}

impl PendingAck {
    pub fn pair() -> (AckSender, PendingAck) {
        let (tx, rx) = oneshot::channel();
        (
            AckSender { tx },
            PendingAck {
                rx,
                outcome: None,
            },
        )
    }

    /// An acknowledgement that is already settled.
    pub fn resolved(result: AckResult) -> Self {
        let (sender, mut ack) = Self::pair();
        sender.resolve(result);
        ack.poll();
        ack
    }

    /// Returns the outcome if it has arrived, without blocking.
    pub fn poll(&mut self) -> Option<AckResult> {
        if self.outcome.is_none() {
            match self.rx.try_recv() {
                Ok(result) => self.outcome = Some(result),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => {
                    self.outcome = Some(Err("acknowledgement dropped before reply".to_string()))
                }
            }
        }
        self.outcome.clone()
    }

    pub fn is_resolved(&mut self) -> bool {
        self.poll().is_some()
    }
}
