//! Device state collection seam.

use crate::error::SyncResult;
use async_trait::async_trait;
use custodian_types::StateSnapshot;

/// Produces the state report sent with each heartbeat.
#[async_trait]
pub trait DeviceStateCollector: Send + Sync {
    async fn collect(&self) -> SyncResult<StateSnapshot>;
}

/// Always reports the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct StaticCollector {
    snapshot: StateSnapshot,
}

impl StaticCollector {
    pub fn new(snapshot: StateSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl DeviceStateCollector for StaticCollector {
    async fn collect(&self) -> SyncResult<StateSnapshot> {
        Ok(self.snapshot.clone())
    }
}
