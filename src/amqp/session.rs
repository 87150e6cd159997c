use super::{AckSender, Channel, ExchangeKind, PendingAck};
use bytes::Bytes;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

enum Command {
    Publish {
        exchange: String,
        routing_key: String,
        payload: Bytes,
    },
    DeclareExchange {
        name: String,
        kind: ExchangeKind,
        passive: bool,
        ack: AckSender,
    },
    StartTransaction,
    CommitTransaction {
        ack: AckSender,
    },
    Close,
}

impl Command {
    fn fail(self, reason: &str) {
        match self {
            Command::DeclareExchange { ack, .. } | Command::CommitTransaction { ack } => {
                ack.fail(reason)
            }
            Command::Publish { exchange, routing_key, payload } => {
                debug!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    bytes = payload.len(),
                    "Dropping message, session unavailable: {}",
                    reason
                );
            }
            Command::StartTransaction | Command::Close => {}
        }
    }
}

/// A [`Channel`] on top of a lapin connection.
///
/// The connection and its single channel live in a session task spawned on
/// the producer's event loop. Every call here only queues a command; the
/// task executes them in order while the loop is pumped, so publishes reach
/// the broker in call order.
pub struct LapinChannel {
    commands: mpsc::UnboundedSender<Command>,
    ready: Arc<AtomicBool>,
}

impl LapinChannel {
    /// Starts connecting to `uri` on the loop behind `handle`.
    ///
    /// Returns immediately; the connection is only established once the loop
    /// runs.
    pub fn open(handle: &Handle, uri: String) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let ready = Arc::new(AtomicBool::new(false));

        handle.spawn(run_session(uri, rx, ready.clone()));

        Self { commands, ready }
    }

    fn send(&self, command: Command) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            command.fail("AMQP session has terminated");
        }
    }
}

impl Channel for LapinChannel {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn publish(&mut self, exchange: &str, routing_key: &str, payload: Bytes) {
        self.send(Command::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
        });
    }

    fn declare_exchange(&mut self, name: &str, kind: ExchangeKind, passive: bool) -> PendingAck {
        let (ack, pending) = PendingAck::pair();
        self.send(Command::DeclareExchange {
            name: name.to_string(),
            kind,
            passive,
            ack,
        });
        pending
    }

    fn start_transaction(&mut self) {
        self.send(Command::StartTransaction);
    }

    fn commit_transaction(&mut self) -> PendingAck {
        let (ack, pending) = PendingAck::pair();
        self.send(Command::CommitTransaction { ack });
        pending
    }

    fn close(&mut self) {
        self.send(Command::Close);
    }
}

async fn run_session(
    uri: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
    ready: Arc<AtomicBool>,
) {
    let connection = match Connection::connect(&uri, ConnectionProperties::default())
        .await
        .map_err(|e| e.to_string())
    {
        Ok(connection) => connection,
        Err(reason) => {
            error!("Failed to connect to AMQP broker: {}", reason);
            reject_all(&mut commands, &reason).await;
            return;
        }
    };

    let channel = match connection.create_channel().await.map_err(|e| e.to_string()) {
        Ok(channel) => channel,
        Err(reason) => {
            error!("Failed to open AMQP channel: {}", reason);
            reject_all(&mut commands, &reason).await;
            return;
        }
    };

    info!(channel_id = channel.id(), "AMQP channel open");
    ready.store(true, Ordering::Release);

    while let Some(command) = commands.recv().await {
        match command {
            Command::Publish { exchange, routing_key, payload } => {
                trace!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    bytes = payload.len(),
                    "Publishing message"
                );
                if let Err(e) = channel
                    .basic_publish(
                        &exchange,
                        &routing_key,
                        BasicPublishOptions::default(),
                        &payload,
                        BasicProperties::default(),
                    )
                    .await
                {
                    warn!(exchange = %exchange, routing_key = %routing_key, "Publish failed: {}", e);
                }
            }
            Command::DeclareExchange { name, kind, passive, ack } => {
                let options = ExchangeDeclareOptions {
                    passive,
                    ..Default::default()
                };
                let result = channel
                    .exchange_declare(&name, kind.into(), options, FieldTable::default())
                    .await;
                ack.resolve(result.map_err(|e| e.to_string()));
            }
            Command::StartTransaction => {
                if let Err(e) = channel.tx_select().await {
                    warn!("Failed to start transaction: {}", e);
                }
            }
            Command::CommitTransaction { ack } => {
                ack.resolve(channel.tx_commit().await.map_err(|e| e.to_string()));
            }
            Command::Close => {
                if let Err(e) = connection.close(200, "OK").await {
                    warn!("Failed to close AMQP connection cleanly: {}", e);
                }
                ready.store(false, Ordering::Release);
                break;
            }
        }
    }

    reject_remaining(&mut commands);
}

async fn reject_all(commands: &mut mpsc::UnboundedReceiver<Command>, reason: &str) {
    while let Some(command) = commands.recv().await {
        let stop = matches!(command, Command::Close);
        command.fail(reason);
        if stop {
            break;
        }
    }
}

fn reject_remaining(commands: &mut mpsc::UnboundedReceiver<Command>) {
    commands.close();
    while let Ok(command) = commands.try_recv() {
        command.fail("AMQP connection closed");
    }
}
