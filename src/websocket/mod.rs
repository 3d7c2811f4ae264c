//! Feed transport
//!
//! A connection is a pair of channels: commands flow from the engine to the
//! connection task, lifecycle and message events flow back. The real transport
//! drives a WebSocket; tests drive the peer end directly.

mod client;

pub use client::WebSocketTransport;

use tokio::sync::mpsc;

use crate::error::{BookSyncError, Result};

/// Raw lifecycle and message events of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    /// The connection is gone; after this no further events are delivered
    Closed,
    Error(String),
}

/// Requests from the engine to the connection task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Send(String),
    Close,
}

/// Opens streaming connections to the market data endpoint
pub trait FeedTransport: Send + 'static {
    fn open(&mut self) -> FeedConnection;
}

/// Engine side of a connection
#[derive(Debug)]
pub struct FeedConnection {
    commands: mpsc::UnboundedSender<TransportCommand>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Connection-task side of a connection
#[derive(Debug)]
pub struct FeedPeer {
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub commands: mpsc::UnboundedReceiver<TransportCommand>,
}

impl FeedConnection {
    /// Create the two ends of a connection
    pub fn channel() -> (FeedConnection, FeedPeer) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            FeedConnection {
                commands: command_tx,
                events: event_rx,
            },
            FeedPeer {
                events: event_tx,
                commands: command_rx,
            },
        )
    }

    pub fn send(&self, text: String) -> Result<()> {
        self.commands
            .send(TransportCommand::Send(text))
            .map_err(|_| BookSyncError::Transport("connection task has exited".to_string()))
    }

    /// Ask the connection task to close; completion is reported as `Closed`
    pub fn close(&self) {
        let _ = self.commands.send(TransportCommand::Close);
    }

    /// Next event, `None` once the connection task has dropped its end
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

impl FeedPeer {
    /// Deliver an event to the engine; ignored once the engine dropped the connection
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }
}
