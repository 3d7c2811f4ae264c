//! Reconnect backoff for callers that retry stalled or lost feeds

use std::time::Duration;
use tokio::time::Instant;

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_MS: u64 = 60_000;
/// Cooldown period after which reconnect attempts are reset (5 minutes)
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(300);

/// Exponential backoff with a reset after a stable session
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base_delay_ms: u64,
    attempts: u32,
    last_subscribed: Option<Instant>,
}

impl ReconnectPolicy {
    pub fn new(base_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            attempts: 0,
            last_subscribed: None,
        }
    }

    /// Record that a subscription came up
    pub fn on_subscribed(&mut self) {
        self.last_subscribed = Some(Instant::now());
    }

    /// Delay before the next reconnect attempt
    pub fn next_delay(&mut self) -> Duration {
        if let Some(last) = self.last_subscribed {
            if last.elapsed() > RECONNECT_COOLDOWN && self.attempts > 0 {
                tracing::info!(
                    previous_attempts = self.attempts,
                    "Resetting reconnect counter after cooldown period"
                );
                self.attempts = 0;
            }
        }

        self.attempts += 1;
        let delay = self
            .base_delay_ms
            .saturating_mul(2u64.pow(self.attempts.min(6)));
        Duration::from_millis(delay.min(MAX_BACKOFF_MS))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
