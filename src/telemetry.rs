//! Process-wide prometheus metrics for the sync engine
//!
//! Every series carries a `symbol` label so engines for different
//! instruments report independently.

use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};
use std::sync::LazyLock;
use tracing::warn;

pub static DIFFS_APPLIED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "orderbook_sync_diffs_applied_total",
        "Price-level diffs applied to the book",
        &["symbol"]
    )
    .expect("valid metric definition")
});

pub static MALFORMED_DIFFS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "orderbook_sync_malformed_diffs_total",
        "Feed messages dropped as malformed",
        &["symbol"]
    )
    .expect("valid metric definition")
});

pub static IGNORED_FRAMES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "orderbook_sync_ignored_frames_total",
        "Frames ignored for carrying a foreign channel id or no book data",
        &["symbol"]
    )
    .expect("valid metric definition")
});

pub static STALLS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "orderbook_sync_stalls_total",
        "Connections declared stalled",
        &["symbol"]
    )
    .expect("valid metric definition")
});

pub static CONNECTIONS_OPENED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "orderbook_sync_connections_opened_total",
        "Transport connections opened",
        &["symbol"]
    )
    .expect("valid metric definition")
});

pub static CONNECTION_STATUS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "orderbook_sync_connection_status",
        "0 idle, 1 connecting, 2 subscribed, 3 disconnected, 4 stalled",
        &["symbol"]
    )
    .expect("valid metric definition")
});

/// Render the default registry in the text exposition format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_gauge_is_per_symbol() {
        CONNECTION_STATUS.with_label_values(&["tTESTA"]).set(2);
        CONNECTION_STATUS.with_label_values(&["tTESTB"]).set(4);

        assert_eq!(CONNECTION_STATUS.with_label_values(&["tTESTA"]).get(), 2);
        assert_eq!(CONNECTION_STATUS.with_label_values(&["tTESTB"]).get(), 4);

        let text = render();
        assert!(text.contains(r#"orderbook_sync_connection_status{symbol="tTESTA"} 2"#));
        assert!(text.contains(r#"orderbook_sync_connection_status{symbol="tTESTB"} 4"#));
    }
}
