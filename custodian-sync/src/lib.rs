//! Sync and enforcement engine for the Custodian device agent.
//!
//! This crate keeps a managed device's lock state aligned with a remote
//! authority while surviving reboots, network loss and local tampering:
//! - [`IdentityManager`]: validated device identity stored redundantly
//! - [`HeartbeatScheduler`]: periodic, non-overlapping state reports
//! - [`SyncQueue`]: durable backlog with exponential backoff
//! - [`LockStateMachine`]: canonical lock state and directive precedence
//! - [`BootReconciler`]: reasserts persisted enforcement before networking
//! - [`Agent`]: the runtime that owns the timers and wires everything up
//!
//! Platform specifics stay behind [`RemoteClient`], [`DeviceStateCollector`]
//! and [`EnforcementExecutor`].

pub mod agent;
pub mod boot;
pub mod cancel;
pub mod collector;
pub mod config;
pub mod enforcement;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod identity;
pub mod lock;
pub mod queue;
pub mod reporter;
pub mod transport;

pub use agent::{Agent, AgentCommand, AgentEvent, AgentHandle, AgentParts, create_agent};
pub use boot::{BootReconciler, BootReport};
pub use cancel::CancelToken;
pub use collector::{DeviceStateCollector, StaticCollector};
pub use config::{IdentityPolicy, RetryPolicy, SyncConfig};
pub use enforcement::EnforcementExecutor;
pub use error::{DirectiveConflict, IdentityError, SyncError, SyncResult, TransitionError};
pub use heartbeat::{HeartbeatScheduler, HeartbeatTask, SchedulerState};
pub use http::{HttpClientConfig, HttpRemoteClient};
pub use identity::{DeviceIdentity, IdentityManager, RepairReport, StoreLocation, validate_identity};
pub use lock::{LoadSource, LockStateMachine, Transition};
pub use queue::{
    DrainOutcome, DrainReport, HeartbeatRecord, QueueStats, RecordKind, SyncQueue, SyncStatus,
};
pub use reporter::{CycleOutcome, HeartbeatReporter};
pub use transport::{DeactivationReport, DeactivationStatus, RemoteClient};
