//! Periodic heartbeat scheduling.
//!
//! The scheduler owns a single timer task. Each tick spawns one heartbeat
//! cycle; a tick that arrives while the previous cycle is still in flight is
//! dropped rather than queued, so cycles never overlap.

use crate::cancel::CancelToken;
use crate::error::{IdentityError, SyncResult};
use crate::identity::IdentityManager;
use crate::reporter::CycleOutcome;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

/// Shortest interval the authority may request.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// The work run on every tick.
#[async_trait]
pub trait HeartbeatTask: Send + Sync {
    async fn run_cycle(&self) -> SyncResult<CycleOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    /// Waiting for the next tick.
    Scheduled,
    /// A cycle is in flight.
    Running,
}

struct Timer {
    interval: Duration,
    cancel: Option<CancelToken>,
}

pub struct HeartbeatScheduler {
    identity: Arc<IdentityManager>,
    task: Arc<dyn HeartbeatTask>,
    timer: Mutex<Timer>,
    in_flight: Arc<AtomicBool>,
    cycles_started: AtomicU64,
    ticks_dropped: AtomicU64,
}

struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl HeartbeatScheduler {
    pub fn new(identity: Arc<IdentityManager>, task: Arc<dyn HeartbeatTask>) -> Arc<Self> {
        Arc::new(Self {
            identity,
            task,
            timer: Mutex::new(Timer {
                interval: Duration::ZERO,
                cancel: None,
            }),
            in_flight: Arc::new(AtomicBool::new(false)),
            cycles_started: AtomicU64::new(0),
            ticks_dropped: AtomicU64::new(0),
        })
    }

    /// Starts ticking every `interval`, first tick immediately.
    pub fn start(self: &Arc<Self>, interval: Duration) -> Result<(), IdentityError> {
        self.start_after(interval, Duration::ZERO)
    }

    /// Starts ticking every `interval`, first tick after `first_delay`.
    ///
    /// Refuses to start without a valid identity. Restarting replaces the
    /// running timer.
    pub fn start_after(
        self: &Arc<Self>,
        interval: Duration,
        first_delay: Duration,
    ) -> Result<(), IdentityError> {
        if let Err(e) = self.identity.require_valid() {
            warn!(error = %e, "heartbeat not started");
            return Err(e);
        }

        let cancel = CancelToken::new();
        {
            let mut timer = self.timer();
            if let Some(previous) = timer.cancel.replace(cancel.clone()) {
                previous.cancel();
            }
            timer.interval = interval.max(MIN_INTERVAL);
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_timer(first_delay, cancel).await });
        info!(interval_secs = interval.as_secs(), "heartbeat started");
        Ok(())
    }

    /// Cancels the timer. A cycle already in flight runs to completion.
    pub fn stop(&self) {
        if let Some(cancel) = self.timer().cancel.take() {
            cancel.cancel();
            info!("heartbeat stopped");
        }
    }

    /// Takes effect from the next tick.
    pub fn set_interval(&self, interval: Duration) {
        let interval = interval.max(MIN_INTERVAL);
        let mut timer = self.timer();
        if timer.interval != interval {
            debug!(interval_secs = interval.as_secs(), "heartbeat interval updated");
            timer.interval = interval;
        }
    }

    pub fn interval(&self) -> Duration {
        self.timer().interval
    }

    pub fn state(&self) -> SchedulerState {
        if self.timer().cancel.is_none() {
            SchedulerState::Stopped
        } else if self.in_flight.load(Ordering::Acquire) {
            SchedulerState::Running
        } else {
            SchedulerState::Scheduled
        }
    }

    /// Runs a cycle now, outside the timer. Returns `false` if the scheduler
    /// is stopped or a cycle is already in flight.
    pub fn trigger_now(self: &Arc<Self>) -> bool {
        if self.state() == SchedulerState::Stopped {
            return false;
        }
        self.fire()
    }

    pub fn cycles_started(&self) -> u64 {
        self.cycles_started.load(Ordering::Relaxed)
    }

    pub fn ticks_dropped(&self) -> u64 {
        self.ticks_dropped.load(Ordering::Relaxed)
    }

    async fn run_timer(self: Arc<Self>, first_delay: Duration, cancel: CancelToken) {
        let mut next_at = Instant::now() + first_delay;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep_until(next_at) => {}
            }
            self.fire();
            next_at = Instant::now() + self.interval();
        }
        debug!("heartbeat timer exited");
    }

    fn fire(self: &Arc<Self>) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.ticks_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("heartbeat still in flight, tick dropped");
            return false;
        }
        self.cycles_started.fetch_add(1, Ordering::Relaxed);

        let guard = InFlight(Arc::clone(&self.in_flight));
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            match this.task.run_cycle().await {
                Ok(outcome) => {
                    if let Some(seconds) = outcome.next_contact_seconds() {
                        this.set_interval(Duration::from_secs(seconds));
                    }
                    if outcome.is_deactivated() {
                        this.stop();
                    }
                }
                Err(e) => warn!(error = %e, "heartbeat cycle failed"),
            }
        });
        true
    }

    fn timer(&self) -> MutexGuard<'_, Timer> {
        // Timer holds plain values; a poisoned lock is still consistent.
        self.timer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
