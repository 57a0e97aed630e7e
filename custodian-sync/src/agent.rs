//! Agent runtime.
//!
//! Wires the identity manager, lock state machine, sync queue and heartbeat
//! scheduler together and owns every timer. Callers talk to it through an
//! [`AgentHandle`] and observe it through [`AgentEvent`]s:
//!
//! ```ignore
//! let (handle, mut events, commands, agent) = create_agent(parts)?;
//! tokio::spawn(agent.run(commands));
//! handle.connectivity_restored().await?;
//! ```

use crate::boot::BootReconciler;
use crate::collector::DeviceStateCollector;
use crate::config::SyncConfig;
use crate::enforcement::EnforcementExecutor;
use crate::error::{IdentityError, SyncError, SyncResult, TransitionError};
use crate::heartbeat::HeartbeatScheduler;
use crate::identity::{IdentityManager, RepairReport, StoreLocation};
use crate::lock::{LockStateMachine, Transition};
use crate::queue::{DrainOutcome, HeartbeatRecord, QueueStats, SyncQueue};
use crate::reporter::HeartbeatReporter;
use crate::transport::{DeactivationReport, DeactivationStatus, RemoteClient};
use custodian_storage::DurableStore;
use custodian_types::{Clock, LockMode, LockState, TamperEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 64;

/// Commands accepted by the agent loop.
#[derive(Debug)]
pub enum AgentCommand {
    /// Deliver queued records now.
    DrainQueue,
    /// Run a heartbeat outside the schedule.
    HeartbeatNow,
    /// Register (or re-register) the device identity.
    Register {
        identity: String,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Shutdown,
}

/// Notifications for the host application.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    BootCompleted {
        mode: LockMode,
        reasserted: bool,
    },
    LockChanged(LockState),
    /// Teardown ran; `confirmed` tells whether the authority acknowledged it.
    Deactivated { confirmed: bool },
    /// A repair pass found divergent identity copies.
    IdentityRepaired(RepairReport),
    /// Records ran out of delivery attempts.
    RecordsFailed { count: usize },
}

/// Everything the agent needs from the platform.
pub struct AgentParts {
    pub config: SyncConfig,
    pub lock_store: Arc<dyn DurableStore>,
    pub queue_store: Arc<dyn DurableStore>,
    pub identity_primary: StoreLocation,
    pub identity_backups: Vec<StoreLocation>,
    pub remote: Arc<dyn RemoteClient>,
    pub collector: Arc<dyn DeviceStateCollector>,
    pub executor: Arc<dyn EnforcementExecutor>,
    pub clock: Arc<dyn Clock>,
}

/// Handle to send commands to the agent.
#[derive(Clone)]
pub struct AgentHandle {
    command_tx: mpsc::Sender<AgentCommand>,
    identity: Arc<IdentityManager>,
    lock: Arc<LockStateMachine>,
    queue: Arc<SyncQueue>,
    clock: Arc<dyn Clock>,
}

impl AgentHandle {
    pub async fn send(&self, cmd: AgentCommand) -> SyncResult<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    /// Call when the platform reports the network is back.
    pub async fn connectivity_restored(&self) -> SyncResult<()> {
        self.send(AgentCommand::DrainQueue).await
    }

    pub async fn heartbeat_now(&self) -> SyncResult<()> {
        self.send(AgentCommand::HeartbeatNow).await
    }

    /// Registers an identity, leaving the deactivated state if needed, and
    /// (re)starts the heartbeat.
    pub async fn register(&self, identity: impl Into<String>) -> SyncResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(AgentCommand::Register {
            identity: identity.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    /// Registers `identity` unless it is already the stored, valid identity.
    /// Returns whether a registration ran.
    ///
    /// Unlike [`register`](Self::register) this never reactivates a
    /// deactivated device that keeps its identity.
    pub async fn ensure_registered(&self, identity: &str) -> SyncResult<bool> {
        let unchanged = self
            .identity
            .get_identity()
            .is_some_and(|current| current.validated && current.id == identity.trim());
        if unchanged {
            debug!("identity already registered");
            return Ok(false);
        }
        self.register(identity).await?;
        Ok(true)
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.send(AgentCommand::Shutdown).await
    }

    /// Locks the device for `event` right away, then queues the report.
    ///
    /// Does not go through the agent loop, so it is never delayed by network
    /// work.
    pub async fn report_tamper(&self, event: TamperEvent) -> SyncResult<Transition> {
        let applied = self.lock.apply_tamper(&event).await;
        if let Err(TransitionError::Terminal) = applied {
            return Err(TransitionError::Terminal.into());
        }

        let record = HeartbeatRecord::tamper(&event, self.clock.now())?;
        self.queue.enqueue(&record)?;
        if self.command_tx.try_send(AgentCommand::DrainQueue).is_err() {
            debug!("agent busy, tamper report left for next sweep");
        }
        Ok(applied?)
    }

    pub async fn admin_lock(&self, mode: LockMode, reason_text: &str) -> SyncResult<Transition> {
        Ok(self.lock.apply_admin_lock(mode, reason_text).await?)
    }

    pub async fn unlock_with_token(&self, token: &str) -> SyncResult<Transition> {
        Ok(self.lock.unlock_with_token(token).await?)
    }

    pub async fn lock_state(&self) -> LockState {
        self.lock.current().await
    }

    pub fn subscribe_lock(&self) -> watch::Receiver<LockState> {
        self.lock.subscribe()
    }

    pub fn queue_stats(&self) -> SyncResult<QueueStats> {
        self.queue.stats()
    }
}

pub struct Agent {
    config: SyncConfig,
    identity: Arc<IdentityManager>,
    lock: Arc<LockStateMachine>,
    queue: Arc<SyncQueue>,
    scheduler: Arc<HeartbeatScheduler>,
    boot: BootReconciler,
    remote: Arc<dyn RemoteClient>,
    delivered: Arc<Notify>,
    event_tx: mpsc::Sender<AgentEvent>,
}

/// Builds the agent and its channels.
///
/// Fails if the persisted lock state cannot be recovered.
pub fn create_agent(
    parts: AgentParts,
) -> SyncResult<(
    AgentHandle,
    mpsc::Receiver<AgentEvent>,
    mpsc::Receiver<AgentCommand>,
    Agent,
)> {
    let AgentParts {
        config,
        lock_store,
        queue_store,
        identity_primary,
        identity_backups,
        remote,
        collector,
        executor,
        clock,
    } = parts;

    let identity = Arc::new(IdentityManager::new(
        identity_primary,
        identity_backups,
        config.identity.clone(),
        Arc::clone(&clock),
    ));
    let (lock, source) = LockStateMachine::open(
        lock_store,
        executor,
        Arc::clone(&clock),
        config.tamper_lock_threshold,
    )?;
    let lock = Arc::new(lock);
    let queue = Arc::new(SyncQueue::new(
        queue_store,
        Arc::clone(&remote),
        Arc::clone(&identity),
        Arc::clone(&lock),
        Arc::clone(&clock),
        config.retry_policy(),
        config.heartbeat_timeout(),
    ));

    let delivered = Arc::new(Notify::new());
    let reporter = Arc::new(
        HeartbeatReporter::new(
            Arc::clone(&identity),
            collector,
            Arc::clone(&remote),
            Arc::clone(&lock),
            Arc::clone(&queue),
            Arc::clone(&clock),
            config.heartbeat_timeout(),
        )
        .with_delivery_signal(Arc::clone(&delivered)),
    );
    let scheduler = HeartbeatScheduler::new(Arc::clone(&identity), reporter.clone());
    let boot = BootReconciler::new(Arc::clone(&lock), reporter, source);

    let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let handle = AgentHandle {
        command_tx,
        identity: Arc::clone(&identity),
        lock: Arc::clone(&lock),
        queue: Arc::clone(&queue),
        clock,
    };
    let agent = Agent {
        config,
        identity,
        lock,
        queue,
        scheduler,
        boot,
        remote,
        delivered,
        event_tx,
    };
    Ok((handle, event_rx, command_rx, agent))
}

impl Agent {
    /// Runs boot reconciliation, then serves commands and timers until
    /// shutdown.
    pub async fn run(self, mut command_rx: mpsc::Receiver<AgentCommand>) -> SyncResult<()> {
        let mut lock_rx = self.lock.subscribe();

        let boot = self.boot.run().await;
        let mut deactivated = boot.restored.is_terminal();
        self.emit(AgentEvent::BootCompleted {
            mode: boot.current.mode,
            reasserted: boot.reasserted,
        });
        if deactivated && !self.lock.deactivation_confirmed() {
            info!("previous deactivation unconfirmed, retrying teardown");
            self.teardown().await;
        }

        if !boot.current.is_terminal() {
            let interval = match &boot.heartbeat {
                Some(Ok(outcome)) => outcome
                    .next_contact_seconds()
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.config.heartbeat_interval()),
                _ => self.config.heartbeat_interval(),
            };
            match self.scheduler.start_after(interval, interval) {
                Ok(()) => {}
                // Logged by the scheduler; registration starts it later.
                Err(IdentityError::Invalid(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval());
        let mut repair = tokio::time::interval(self.config.repair_interval());
        for timer in [&mut sweep, &mut cleanup, &mut repair] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!(deactivated, "agent running");
        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    debug!(?cmd, "agent command");
                    match cmd {
                        AgentCommand::Shutdown => {
                            info!("agent shutting down");
                            break;
                        }
                        AgentCommand::DrainQueue => {
                            if !deactivated {
                                self.spawn_drain();
                            }
                        }
                        AgentCommand::HeartbeatNow => {
                            if !self.scheduler.trigger_now() {
                                debug!("heartbeat not triggered");
                            }
                        }
                        AgentCommand::Register { identity, reply } => {
                            let result = self.register(&identity).await;
                            if result.is_ok() {
                                deactivated = false;
                            }
                            let _ = reply.send(result);
                        }
                    }
                }
                _ = self.delivered.notified(), if !deactivated => self.spawn_drain(),
                _ = sweep.tick(), if !deactivated => self.spawn_drain(),
                _ = cleanup.tick() => self.run_cleanup(),
                _ = repair.tick(), if !deactivated => self.run_repair(),
                changed = lock_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = lock_rx.borrow_and_update().clone();
                    let terminal = state.is_terminal();
                    self.emit(AgentEvent::LockChanged(state));
                    if terminal && !deactivated {
                        deactivated = true;
                        self.teardown().await;
                    }
                }
            }
        }

        self.scheduler.stop();
        info!("agent stopped");
        Ok(())
    }

    async fn register(&self, identity: &str) -> SyncResult<()> {
        self.identity.set_identity(identity)?;
        self.lock.reactivate().await?;
        self.scheduler.start(self.config.heartbeat_interval())?;
        Ok(())
    }

    /// Stops reporting and tells the authority how teardown went.
    async fn teardown(&self) {
        self.scheduler.stop();

        let report = if self.lock.last_enforcement_succeeded() {
            DeactivationReport::success("device management removed")
        } else {
            DeactivationReport::failed("enforcement layer could not remove management")
        };

        let confirmed = match self.identity.require_valid() {
            Ok(identity) => {
                let sent = tokio::time::timeout(
                    self.config.heartbeat_timeout(),
                    self.remote.confirm_deactivation(&identity, &report),
                )
                .await
                .unwrap_or(Err(SyncError::Timeout));
                match sent {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "deactivation confirmation not delivered");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot confirm deactivation without identity");
                false
            }
        };

        // A failed teardown is reported again after the next boot reassertion.
        if confirmed && report.status == DeactivationStatus::Success {
            if let Err(e) = self.lock.mark_deactivation_confirmed() {
                warn!(error = %e, "deactivation confirmation not recorded");
            }
        }

        info!(status = ?report.status, confirmed, "deactivation teardown complete");
        self.emit(AgentEvent::Deactivated { confirmed });
    }

    fn spawn_drain(&self) {
        let queue = Arc::clone(&self.queue);
        let scheduler = Arc::clone(&self.scheduler);
        let events = self.event_tx.clone();
        let batch_size = self.config.batch_size;
        tokio::spawn(async move {
            match queue.drain(batch_size).await {
                Ok(DrainOutcome::Completed(report)) => {
                    if let Some(seconds) = report.next_contact_seconds {
                        scheduler.set_interval(Duration::from_secs(seconds));
                    }
                    if report.failed > 0 {
                        emit(&events, AgentEvent::RecordsFailed {
                            count: report.failed,
                        });
                    }
                }
                Ok(DrainOutcome::AlreadyRunning) => {}
                Err(SyncError::Identity(e)) => debug!(error = %e, "queue not drained"),
                Err(e) => warn!(error = %e, "queue drain failed"),
            }
        });
    }

    fn run_cleanup(&self) {
        if let Err(e) = self.queue.cleanup(self.config.retention()) {
            warn!(error = %e, "queue cleanup failed");
        }
    }

    fn run_repair(&self) {
        let report = self.identity.verify_and_repair();
        if !report.is_consistent() {
            self.emit(AgentEvent::IdentityRepaired(report));
        }
    }

    fn emit(&self, event: AgentEvent) {
        emit(&self.event_tx, event);
    }
}

fn emit(tx: &mpsc::Sender<AgentEvent>, event: AgentEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
        debug!(?event, "event channel full, dropping event");
    }
}
