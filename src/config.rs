//! Tunables for links, the event queue and checksum health tracking.
//!
//! Every struct deserializes with `#[serde(default)]`, so a partial document
//! only overrides the fields it names. Durations are carried as milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{LinkError, Result};
use crate::protocol::{ProtocolVersion, MAX_BUFFER_LEN};

/// Default baud rate of the SM1 master.
pub const DEFAULT_BAUD: u32 = 38400;

/// Per-channel link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub protocol: ProtocolVersion,
    pub checksum_enabled: bool,
    /// Serial read timeout; also bounds how quickly the reader notices a stop.
    pub read_timeout_ms: u64,
    /// Pause after a failed read before trying again.
    pub read_error_backoff_ms: u64,
    /// Consecutive failed reads after which the link counts as lost.
    pub max_consecutive_read_errors: u32,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub join_timeout_ms: u64,
    pub transmit_timeout_ms: u64,
    pub max_buffer_len: usize,
    pub health: HealthConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolVersion::V1,
            checksum_enabled: true,
            read_timeout_ms: 100,
            read_error_backoff_ms: 100,
            max_consecutive_read_errors: 20,
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 10,
            join_timeout_ms: 5_000,
            transmit_timeout_ms: 500,
            max_buffer_len: MAX_BUFFER_LEN,
            health: HealthConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn read_error_backoff(&self) -> Duration {
        Duration::from_millis(self.read_error_backoff_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn transmit_timeout(&self) -> Duration {
        Duration::from_millis(self.transmit_timeout_ms)
    }

    /// Reject settings that would stall or spin the link.
    pub fn validate(&self) -> Result<()> {
        if self.max_reconnect_attempts == 0 {
            return Err(LinkError::InvalidConfig(
                "max_reconnect_attempts must be at least 1".into(),
            ));
        }
        if self.max_consecutive_read_errors == 0 {
            return Err(LinkError::InvalidConfig(
                "max_consecutive_read_errors must be at least 1".into(),
            ));
        }
        if self.max_buffer_len < 2 * crate::protocol::INBOUND_FRAME_LEN {
            return Err(LinkError::InvalidConfig(format!(
                "max_buffer_len {} is too small to hold two frames",
                self.max_buffer_len
            )));
        }
        if self.read_timeout_ms == 0 || self.transmit_timeout_ms == 0 {
            return Err(LinkError::InvalidConfig(
                "read and transmit timeouts must be non-zero".into(),
            ));
        }
        self.health.validate()
    }
}

/// Checksum health thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Number of recent outcomes kept for the error-rate window.
    pub window: usize,
    pub consecutive_threshold: u32,
    /// Recent error rate (0.0-1.0) at which a rate alert is raised.
    pub rate_threshold: f64,
    /// Minimum spacing between two alerts of the same kind.
    pub alert_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: 100,
            consecutive_threshold: 5,
            rate_threshold: 0.05,
            alert_interval_ms: 60_000,
        }
    }
}

impl HealthConfig {
    pub fn alert_interval(&self) -> Duration {
        Duration::from_millis(self.alert_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            return Err(LinkError::InvalidConfig("health window must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.rate_threshold) {
            return Err(LinkError::InvalidConfig(format!(
                "rate_threshold {} outside 0.0..=1.0",
                self.rate_threshold
            )));
        }
        Ok(())
    }
}

/// Event queue and consumer pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub tick_ms: u64,
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            tick_ms: 50,
            batch_size: 10,
        }
    }
}

impl QueueConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || self.batch_size == 0 || self.tick_ms == 0 {
            return Err(LinkError::InvalidConfig(
                "queue capacity, batch size and tick must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
