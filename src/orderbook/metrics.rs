//! Book metrics derived from a snapshot

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{BookSnapshot, PriceLevel};

/// Computed metrics for an emitted snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookMetrics {
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,

    /// Mid price (average of best bid and ask)
    pub mid_price: Option<Decimal>,

    /// Spread in basis points
    pub spread_bps: Option<Decimal>,

    /// Total visible bid size
    pub bid_depth: Decimal,

    /// Total visible ask size
    pub ask_depth: Decimal,

    pub bid_levels: usize,
    pub ask_levels: usize,
}

impl BookMetrics {
    pub fn from_snapshot(snapshot: &BookSnapshot) -> Self {
        let best_bid = snapshot.bids.first().map(|l| l.price);
        let best_ask = snapshot.asks.first().map(|l| l.price);

        let mid_price = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => bid
                .checked_add(ask)
                .and_then(|sum| sum.checked_div(Decimal::TWO)),
            _ => None,
        };

        let spread_bps = match (best_bid, best_ask, mid_price) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => ask
                .checked_sub(bid)
                .and_then(|spread| spread.checked_div(mid))
                .and_then(|ratio| ratio.checked_mul(Decimal::from(10000))),
            _ => None,
        };

        Self {
            best_bid,
            best_ask,
            mid_price,
            spread_bps,
            bid_depth: total_size(&snapshot.bids),
            ask_depth: total_size(&snapshot.asks),
            bid_levels: snapshot.bids.len(),
            ask_levels: snapshot.asks.len(),
        }
    }

    /// Both sides carry at least one level
    pub fn is_two_sided(&self) -> bool {
        self.bid_levels > 0 && self.ask_levels > 0
    }
}

/// Sum of level sizes, saturating at `Decimal::MAX`
fn total_size(levels: &[PriceLevel]) -> Decimal {
    levels.iter().fold(Decimal::ZERO, |total, level| {
        total.checked_add(level.size).unwrap_or(Decimal::MAX)
    })
}
