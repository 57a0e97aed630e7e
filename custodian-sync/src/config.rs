//! Engine configuration.
//!
//! Durations are stored as plain integers so the config file stays readable;
//! accessor methods hand out `Duration`s.

use custodian_types::Severity;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Time between heartbeats unless the authority asks otherwise.
    pub heartbeat_interval_secs: u64,
    /// Upper bound on a single delivery attempt.
    pub heartbeat_timeout_secs: u64,
    /// Records delivered per drain.
    pub batch_size: usize,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Failed attempts after which a record is parked as FAILED.
    pub max_retries: u32,
    /// How long SYNCED and FAILED records are kept.
    pub retention_secs: u64,
    /// Fallback drain period when no connectivity signal arrives.
    pub sweep_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub repair_interval_secs: u64,
    /// Tamper events below this severity are reported but do not lock.
    pub tamper_lock_threshold: Severity,
    pub identity: IdentityPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15 * 60,
            heartbeat_timeout_secs: 30,
            batch_size: 10,
            initial_retry_delay_ms: 1_000,
            max_retry_delay_ms: 16_000,
            max_retries: 5,
            retention_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
            cleanup_interval_secs: 60 * 60,
            repair_interval_secs: 6 * 60 * 60,
            tamper_lock_threshold: Severity::Low,
            identity: IdentityPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Parses a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn repair_interval(&self) -> Duration {
        Duration::from_secs(self.repair_interval_secs.max(1))
    }

    /// Backoff policy for queued deliveries.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.initial_retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            max_retries: self.max_retries,
        }
    }
}

/// Rules a device identity must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityPolicy {
    pub min_length: usize,
    /// Compared case-insensitively against the trimmed candidate.
    pub placeholders: Vec<String>,
}

impl Default for IdentityPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            placeholders: [
                "unknown",
                "null",
                "none",
                "nil",
                "default",
                "undefined",
                "android_id",
                "9774d56d682e549c",
                "000000000000000",
                "123456789abcdef",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Delay before the next attempt of a record that has failed
    /// `retry_count` times.
    ///
    /// `min(initial * 2^retry_count, max)`: a report queued after a failed
    /// live send waits 1s, then 2, 4, 8, 16, 16, ... with the defaults.
    pub fn delay_after(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether a record with this many failures is out of attempts.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        SyncConfig::default().retry_policy()
    }
}
