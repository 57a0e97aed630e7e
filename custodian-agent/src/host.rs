//! Host state collection.

use async_trait::async_trait;
use custodian_sync::{DeviceStateCollector, SyncResult};
use custodian_types::{Clock, StateSnapshot, Timestamp};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;

/// Facts about the host sent with every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostReport {
    pub os_name: String,
    pub os_version: String,
    pub hostname: String,
    pub arch: String,
    pub machine_id: Option<String>,
    pub agent_version: String,
    pub collected_at: Timestamp,
}

impl HostReport {
    pub fn collect(now: Timestamp) -> Self {
        Self {
            os_name: env::consts::OS.to_string(),
            os_version: os_version(),
            hostname: host_name(),
            arch: env::consts::ARCH.to_string(),
            machine_id: machine_id(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            collected_at: now,
        }
    }
}

pub struct HostCollector {
    clock: Arc<dyn Clock>,
}

impl HostCollector {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl DeviceStateCollector for HostCollector {
    async fn collect(&self) -> SyncResult<StateSnapshot> {
        let report = HostReport::collect(self.clock.now());
        Ok(StateSnapshot::from_serializable(&report)?)
    }
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn os_version() -> String {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|content| {
                content
                    .lines()
                    .find(|l| l.starts_with("VERSION_ID="))
                    .map(|l| {
                        l.trim_start_matches("VERSION_ID=")
                            .trim_matches('"')
                            .to_string()
                    })
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(not(target_os = "linux"))]
    {
        "unknown".to_string()
    }
}

/// The OS-provided machine id, where the platform has one.
pub fn machine_id() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/machine-id")
            .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
