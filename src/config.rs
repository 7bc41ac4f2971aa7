//! Engine configuration.

use serde::Deserialize;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::unit::UnitFailurePolicy;

/// Engine settings loaded from environment variables.
///
/// Environment variables are prefixed with `WAYPOINT_`:
/// - `WAYPOINT_EVENT_BUFFER`: events kept per task for slow subscribers (default: 256)
/// - `WAYPOINT_UNIT_TIMEOUT_SECS`: bound on a single work unit call (default: 120)
/// - `WAYPOINT_UNIT_MAX_RETRIES`: retries of a transient unit failure (default: 2)
/// - `WAYPOINT_UNIT_RETRY_DELAY_MS`: first retry delay, doubling after (default: 1000)
/// - `WAYPOINT_UNIT_FAILURE_POLICY`: `skip_and_continue` or `abort_step`
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,

    #[serde(default = "default_unit_max_retries")]
    pub unit_max_retries: u32,

    #[serde(default = "default_unit_retry_delay_ms")]
    pub unit_retry_delay_ms: u64,

    #[serde(default)]
    pub unit_failure_policy: UnitFailurePolicy,
}

fn default_event_buffer() -> usize {
    256
}

fn default_unit_timeout_secs() -> u64 {
    120
}

fn default_unit_max_retries() -> u32 {
    2
}

fn default_unit_retry_delay_ms() -> u64 {
    1000
}

impl EngineConfig {
    /// Load configuration from `WAYPOINT_`-prefixed environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("WAYPOINT_").from_env::<EngineConfig>()
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    pub fn unit_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.unit_max_retries,
            Duration::from_millis(self.unit_retry_delay_ms),
        )
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
            unit_timeout_secs: default_unit_timeout_secs(),
            unit_max_retries: default_unit_max_retries(),
            unit_retry_delay_ms: default_unit_retry_delay_ms(),
            unit_failure_policy: UnitFailurePolicy::default(),
        }
    }
}
