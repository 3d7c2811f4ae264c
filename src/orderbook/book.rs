//! Price-level book store
//!
//! Uses BTreeMap for sorted price level management. Bids are keyed by
//! `Reverse<Decimal>` so both maps iterate best price first.

use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::{BookSnapshot, PriceLevel, Side, SubscriptionParams};
use crate::error::{BookSyncError, Result};
use crate::parser::LevelDiff;

/// Authoritative book for the active subscription
#[derive(Debug)]
pub struct BookStore {
    symbol: String,
    precision: u8,
    epoch: u64,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, PriceLevel>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, PriceLevel>,
}

impl BookStore {
    /// Create a new empty book
    pub fn new(params: &SubscriptionParams) -> Self {
        Self {
            symbol: params.symbol.clone(),
            precision: params.precision,
            epoch: 0,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
        }
    }

    /// Apply a single price-level diff
    ///
    /// The store is left untouched when the diff is rejected.
    pub fn apply_diff(&mut self, diff: &LevelDiff) -> Result<()> {
        validate(diff)?;
        self.apply_unchecked(diff);
        Ok(())
    }

    /// Apply a full-book frame; nothing is applied if any level is malformed
    pub fn apply_batch(&mut self, diffs: &[LevelDiff]) -> Result<()> {
        diffs.iter().try_for_each(validate)?;
        for diff in diffs {
            self.apply_unchecked(diff);
        }
        Ok(())
    }

    fn apply_unchecked(&mut self, diff: &LevelDiff) {
        let price = diff.price;

        if diff.count == 0 {
            self.bids.remove(&Reverse(price));
            self.asks.remove(&price);
            return;
        }

        let level = PriceLevel {
            price,
            count: diff.count,
            size: diff.amount.abs(),
        };

        if diff.amount.is_sign_positive() {
            self.bids.insert(Reverse(price), level);
            self.asks.remove(&price);
        } else {
            self.asks.insert(price, level);
            self.bids.remove(&Reverse(price));
        }
    }

    /// Drop every level
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    /// Clear the book and bind it to a new subscription generation
    pub fn reset(&mut self, params: &SubscriptionParams, epoch: u64) {
        self.clear();
        self.symbol = params.symbol.clone();
        self.precision = params.precision;
        self.epoch = epoch;
    }

    /// Copy out the top `max_rows` levels of each side
    pub fn snapshot(&self, max_rows: usize) -> BookSnapshot {
        BookSnapshot {
            symbol: self.symbol.clone(),
            precision: self.precision,
            epoch: self.epoch,
            timestamp: chrono::Utc::now().timestamp_millis(),
            bids: self.bids.values().take(max_rows).copied().collect(),
            asks: self.asks.values().take(max_rows).copied().collect(),
        }
    }

    /// Level resting at `price` on `side`, if any
    pub fn level(&self, side: Side, price: Decimal) -> Option<&PriceLevel> {
        match side {
            Side::Bid => self.bids.get(&Reverse(price)),
            Side::Ask => self.asks.get(&price),
        }
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

fn validate(diff: &LevelDiff) -> Result<()> {
    if diff.price <= Decimal::ZERO {
        return Err(BookSyncError::MalformedDiff(format!(
            "non-positive price {}",
            diff.price
        )));
    }
    if diff.count > 0 && diff.amount.is_zero() {
        return Err(BookSyncError::MalformedDiff(format!(
            "zero amount for live level at {}",
            diff.price
        )));
    }
    Ok(())
}
