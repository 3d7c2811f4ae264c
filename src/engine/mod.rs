//! Sync engine
//!
//! Owns the feed connection lifecycle for one symbol and keeps the book in
//! step with it. Callers talk to the running engine through an
//! [`EngineHandle`]; results come back as ordered [`EngineEvent`]s.

mod reconnect;
mod sync;

#[cfg(test)]
mod tests;

pub use reconnect::ReconnectPolicy;
pub use sync::SyncEngine;

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{BookSyncError, Result};
use crate::orderbook::BookSnapshot;
use crate::websocket::FeedTransport;

/// Caller-visible connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Subscribed,
    Disconnected,
    Stalled,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Subscribed => "subscribed",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Stalled => "stalled",
        }
    }

    fn gauge_value(&self) -> i64 {
        match self {
            ConnectionStatus::Idle => 0,
            ConnectionStatus::Connecting => 1,
            ConnectionStatus::Subscribed => 2,
            ConnectionStatus::Disconnected => 3,
            ConnectionStatus::Stalled => 4,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-fatal conditions surfaced to the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineWarning {
    /// No book data yet after the loading window
    LoadingSlow { waited_ms: u64 },
    /// A feed message was dropped to protect the book
    MalformedDiff(String),
    /// A frame could not be decoded at all
    Decode(String),
    /// The connection was lost or refused
    Transport(String),
}

/// Output of the engine, delivered in processing order
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Status(ConnectionStatus),
    Snapshot(BookSnapshot),
    Warning(EngineWarning),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    Reconnect,
    ChangePrecision(u8),
    Shutdown,
}

/// Non-blocking control surface of a running engine
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    precision_min: u8,
    precision_max: u8,
}

impl EngineHandle {
    pub fn connect(&self) -> Result<()> {
        self.send(Command::Connect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    /// Disconnect, then connect again with the last-used parameters
    pub fn reconnect(&self) -> Result<()> {
        self.send(Command::Reconnect)
    }

    /// Resubscribe at a new precision; the book is rebuilt from scratch
    pub fn change_precision(&self, precision: u8) -> Result<()> {
        if precision < self.precision_min || precision > self.precision_max {
            return Err(BookSyncError::PrecisionOutOfRange {
                precision,
                min: self.precision_min,
                max: self.precision_max,
            });
        }
        self.send(Command::ChangePrecision(precision))
    }

    /// Close the transport and stop the engine task
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    /// Latest published status
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| BookSyncError::EngineStopped)
    }
}

/// A running engine
pub struct SpawnedEngine {
    pub handle: EngineHandle,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub task: JoinHandle<()>,
}

/// Validate `config` and start an engine task on the current runtime
pub fn spawn<T: FeedTransport>(config: Config, transport: T) -> Result<SpawnedEngine> {
    config.validate()?;

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Idle);

    let handle = EngineHandle {
        commands: command_tx,
        status: status_rx,
        precision_min: config.precision_min,
        precision_max: config.precision_max,
    };

    let engine = SyncEngine::new(config, transport, command_rx, event_tx, status_tx);
    let task = tokio::spawn(engine.run());

    Ok(SpawnedEngine {
        handle,
        events: event_rx,
        task,
    })
}
