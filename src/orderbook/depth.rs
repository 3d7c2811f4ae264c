//! Cumulative depth projection used to size the rendered depth bars

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::PriceLevel;

/// One rendered row of cumulative depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthRow {
    pub price: Decimal,
    pub size: Decimal,
    /// Sum of sizes from the best level down to this one
    pub cumulative_size: Decimal,
    /// `cumulative_size` relative to the deepest row of the slice, in percent
    pub bar_width_percent: Decimal,
}

/// Project the first `top_n` levels (already ordered best first) into depth rows
pub fn project(levels: &[PriceLevel], top_n: usize) -> Vec<DepthRow> {
    let visible = &levels[..levels.len().min(top_n)];

    let mut running = Decimal::ZERO;
    let cumulative: Vec<Decimal> = visible
        .iter()
        .map(|level| {
            running = running.checked_add(level.size).unwrap_or(Decimal::MAX);
            running
        })
        .collect();

    let total = running;
    let hundred = Decimal::ONE_HUNDRED;

    visible
        .iter()
        .zip(cumulative)
        .map(|(level, cumulative_size)| DepthRow {
            price: level.price,
            size: level.size,
            cumulative_size,
            bar_width_percent: if total.is_zero() {
                Decimal::ZERO
            } else {
                percent_of(cumulative_size, total, hundred)
            },
        })
        .collect()
}

/// `part / total * hundred`, saturating where the product exceeds `Decimal`
fn percent_of(part: Decimal, total: Decimal, hundred: Decimal) -> Decimal {
    part.checked_div(total)
        .and_then(|ratio| ratio.checked_mul(hundred))
        .unwrap_or(hundred)
}
