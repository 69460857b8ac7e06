use backon::ExponentialBuilder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport settings shared by every peer session, from the top-level `connectionOptions`.
/// All durations are in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PeerTransportOptions {
    pub reconnection: bool,
    pub reconnection_delay: u64,
    pub reconnection_delay_max: u64,
    /// Connect timeout.
    pub timeout: u64,
}

impl Default for PeerTransportOptions {
    fn default() -> Self {
        Self {
            reconnection: true,
            reconnection_delay: 30_000,
            reconnection_delay_max: 50_000,
            timeout: 30_000,
        }
    }
}

impl PeerTransportOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_max.max(self.reconnection_delay))
    }

    /// Delays between reconnection attempts. Never runs out.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.reconnection_delay))
            .with_max_delay(self.max_delay())
            .with_jitter()
            .without_max_times()
    }
}
