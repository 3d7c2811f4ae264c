//! Configuration module for the order book synchronization engine

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{BookSyncError, Result};
use crate::orderbook::{SubscriptionParams, MAX_PRECISION};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Instrument to subscribe to (e.g., "tBTCUSD")
    pub symbol: String,

    /// WebSocket endpoint for the public feed
    pub ws_endpoint: String,

    /// Precision used for the first subscription
    pub precision: u8,

    /// Inclusive precision bounds accepted by `change_precision`
    pub precision_min: u8,
    pub precision_max: u8,

    /// Rows retained per side in emitted snapshots
    pub top_n: usize,

    /// Delay before warning that no book data has arrived yet
    pub loading_timeout_ms: u64,

    /// Silence window before the connection is declared stalled
    pub stale_timeout_ms: u64,

    /// Upper bound on waiting for the transport to acknowledge a close
    pub close_timeout_ms: u64,

    /// Reconnection settings (applied by the caller, not the engine)
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,

    /// Port of the health check server
    pub health_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            symbol: env::var("SYMBOL").unwrap_or(defaults.symbol),
            ws_endpoint: env::var("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            precision: env_or("PRECISION", defaults.precision),
            precision_min: env_or("PRECISION_MIN", defaults.precision_min),
            precision_max: env_or("PRECISION_MAX", defaults.precision_max),
            top_n: env_or("TOP_N", defaults.top_n),
            loading_timeout_ms: env_or("LOADING_TIMEOUT_MS", defaults.loading_timeout_ms),
            stale_timeout_ms: env_or("STALE_TIMEOUT_MS", defaults.stale_timeout_ms),
            close_timeout_ms: env_or("CLOSE_TIMEOUT_MS", defaults.close_timeout_ms),
            auto_reconnect: env_or("AUTO_RECONNECT", defaults.auto_reconnect),
            reconnect_delay_ms: env_or("RECONNECT_DELAY_MS", defaults.reconnect_delay_ms),
            health_port: env_or("HEALTH_PORT", defaults.health_port),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(BookSyncError::ConfigError("symbol must not be empty".into()));
        }
        if self.precision_min > self.precision_max {
            return Err(BookSyncError::ConfigError(format!(
                "precision bounds inverted: [{}, {}]",
                self.precision_min, self.precision_max
            )));
        }
        if self.precision_max > MAX_PRECISION {
            return Err(BookSyncError::ConfigError(format!(
                "precision_max {} exceeds {}",
                self.precision_max, MAX_PRECISION
            )));
        }
        self.check_precision(self.precision)?;
        if self.top_n == 0 {
            return Err(BookSyncError::ConfigError("top_n must be positive".into()));
        }
        if self.loading_timeout_ms == 0 || self.stale_timeout_ms == 0 || self.close_timeout_ms == 0 {
            return Err(BookSyncError::ConfigError("timeouts must be positive".into()));
        }
        Ok(())
    }

    /// Check a precision against the configured bounds
    pub fn check_precision(&self, precision: u8) -> Result<()> {
        if precision < self.precision_min || precision > self.precision_max {
            return Err(BookSyncError::PrecisionOutOfRange {
                precision,
                min: self.precision_min,
                max: self.precision_max,
            });
        }
        Ok(())
    }

    /// Parameters of the first subscription
    pub fn initial_params(&self) -> SubscriptionParams {
        SubscriptionParams::new(&self.symbol, self.precision)
    }

    pub fn loading_timeout(&self) -> Duration {
        Duration::from_millis(self.loading_timeout_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol: "tBTCUSD".to_string(),
            ws_endpoint: "wss://api-pub.bitfinex.com/ws/2".to_string(),
            precision: 0,
            precision_min: 0,
            precision_max: MAX_PRECISION,
            top_n: 10,
            loading_timeout_ms: 3_000,
            stale_timeout_ms: 15_000,
            close_timeout_ms: 2_000,
            auto_reconnect: true,
            reconnect_delay_ms: 1_000,
            health_port: 9090,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
