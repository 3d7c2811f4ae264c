//! Order book synchronization engine
//!
//! This crate keeps a live, price-sorted order book in step with the Bitfinex
//! v2 `book` channel and publishes consistent snapshots for rendering and
//! cumulative depth analytics.

pub mod config;
pub mod engine;
pub mod error;
pub mod orderbook;
pub mod parser;
pub mod telemetry;
pub mod websocket;

pub use config::Config;
pub use engine::{
    spawn, ConnectionStatus, EngineEvent, EngineHandle, EngineWarning, ReconnectPolicy,
    SpawnedEngine, SyncEngine,
};
pub use error::{BookSyncError, Result};
pub use orderbook::{project, BookMetrics, BookSnapshot, BookStore, DepthRow, PriceLevel, Side, SubscriptionParams};
pub use parser::{decode, encode_subscribe, ChannelId, LevelDiff, ProtocolEvent};
pub use websocket::{FeedConnection, FeedTransport, TransportEvent, WebSocketTransport};
