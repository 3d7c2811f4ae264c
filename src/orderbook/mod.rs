//! Order book module
//!
//! Maintains the price-level book built from the feed's diff stream.

mod book;
mod depth;
mod metrics;

pub use book::BookStore;
pub use depth::{project, DepthRow};
pub use metrics::BookMetrics;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Highest aggregation level offered by the feed (`P0`..`P4`)
pub const MAX_PRECISION: u8 = 4;

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// Aggregated quantity resting at one price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    /// Number of orders contributing to the level
    pub count: u32,
    /// Always a non-negative magnitude, the map holding the level gives the side
    pub size: Decimal,
}

/// What to subscribe to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub symbol: String,
    pub precision: u8,
}

impl SubscriptionParams {
    pub fn new(symbol: &str, precision: u8) -> Self {
        Self {
            symbol: symbol.to_string(),
            precision,
        }
    }

    pub fn with_precision(&self, precision: u8) -> Self {
        Self {
            symbol: self.symbol.clone(),
            precision,
        }
    }
}

/// Immutable, ordered copy of the book handed to consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub symbol: String,
    pub precision: u8,
    /// Subscription generation the levels belong to
    pub epoch: u64,
    /// Milliseconds since the Unix epoch at creation
    pub timestamp: i64,
    /// Descending by price
    pub bids: Vec<PriceLevel>,
    /// Ascending by price
    pub asks: Vec<PriceLevel>,
}

impl BookSnapshot {
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Cumulative depth rows for the top `top_n` bids
    pub fn bid_depth(&self, top_n: usize) -> Vec<DepthRow> {
        project(&self.bids, top_n)
    }

    /// Cumulative depth rows for the top `top_n` asks
    pub fn ask_depth(&self, top_n: usize) -> Vec<DepthRow> {
        project(&self.asks, top_n)
    }

    pub fn metrics(&self) -> BookMetrics {
        BookMetrics::from_snapshot(self)
    }
}
