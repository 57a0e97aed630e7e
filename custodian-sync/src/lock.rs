//! The lock state machine.
//!
//! One canonical [`LockState`] per device, persisted before it is enforced
//! and mirrored to a shadow key so a single corrupt write is survivable.
//! Remote directives and local tamper events both flow through here; the
//! precedence rules between them live in [`LockStateMachine::apply_directive`].

use crate::enforcement::EnforcementExecutor;
use crate::error::{DirectiveConflict, SyncError, SyncResult, TransitionError};
use custodian_storage::{DurableStore, get_json, set_json};
use custodian_types::{
    Authority, Clock, Directive, LockMode, LockState, ReasonCategory, Severity, TamperEvent,
    Timestamp,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

pub const LOCK_STATE_KEY: &str = "lock_state";
pub const LOCK_STATE_SHADOW_KEY: &str = "lock_state.shadow";
pub const UNLOCK_TOKEN_KEY: &str = "lock_state.unlock_token";
/// Set once the authority has acknowledged a deactivation teardown.
pub const DEACTIVATION_CONFIRMED_KEY: &str = "lock_state.deactivation_confirmed";

/// Where the state was recovered from on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    /// The primary record was missing or corrupt.
    Shadow,
    /// Nothing persisted; first boot.
    Fresh,
}

/// The effect of one accepted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: LockState,
    pub to: LockState,
    /// Whether the enforcement executor was invoked and succeeded.
    pub enforced: bool,
}

impl Transition {
    /// Whether mode or reason changed.
    pub fn changed(&self) -> bool {
        !self
            .from
            .same_assertion(self.to.mode, self.to.reason_category)
    }
}

pub struct LockStateMachine {
    store: Arc<dyn DurableStore>,
    executor: Arc<dyn EnforcementExecutor>,
    clock: Arc<dyn Clock>,
    tamper_threshold: Severity,
    state: Mutex<LockState>,
    updates: watch::Sender<LockState>,
    last_enforcement_ok: AtomicBool,
}

impl LockStateMachine {
    /// Loads the persisted state, falling back to the shadow copy.
    ///
    /// Fails when no copy decodes and at least one of them is corrupt.
    pub fn open(
        store: Arc<dyn DurableStore>,
        executor: Arc<dyn EnforcementExecutor>,
        clock: Arc<dyn Clock>,
        tamper_threshold: Severity,
    ) -> SyncResult<(Self, LoadSource)> {
        let primary = get_json::<LockState>(store.as_ref(), LOCK_STATE_KEY);
        let shadow = get_json::<LockState>(store.as_ref(), LOCK_STATE_SHADOW_KEY);

        let (state, source) = match (primary, shadow) {
            (Ok(Some(state)), _) => (state, LoadSource::Primary),
            (primary, Ok(Some(state))) => {
                if let Err(e) = &primary {
                    warn!(error = %e, "lock state corrupt, recovered from shadow copy");
                }
                set_json(store.as_ref(), LOCK_STATE_KEY, &state)?;
                (state, LoadSource::Shadow)
            }
            (Ok(None), Ok(None)) => {
                let state = LockState::initial(clock.now());
                set_json(store.as_ref(), LOCK_STATE_KEY, &state)?;
                set_json(store.as_ref(), LOCK_STATE_SHADOW_KEY, &state)?;
                (state, LoadSource::Fresh)
            }
            (Err(e), _) | (Ok(None), Err(e)) => {
                error!(error = %e, "lock state unrecoverable");
                return Err(SyncError::CorruptLockState(e.to_string()));
            }
        };

        info!(
            mode = %state.mode,
            reason = %state.reason_category,
            source = ?source,
            "lock state loaded"
        );

        let (updates, _) = watch::channel(state.clone());
        Ok((
            Self {
                store,
                executor,
                clock,
                tamper_threshold,
                state: Mutex::new(state),
                updates,
                last_enforcement_ok: AtomicBool::new(true),
            },
            source,
        ))
    }

    pub async fn current(&self) -> LockState {
        self.state.lock().await.clone()
    }

    pub async fn is_terminal(&self) -> bool {
        self.state.lock().await.is_terminal()
    }

    /// Receives every committed state.
    pub fn subscribe(&self) -> watch::Receiver<LockState> {
        self.updates.subscribe()
    }

    /// Drives the executor to the current state again, deactivation
    /// included. Used at boot before any network call.
    pub async fn reassert(&self) -> bool {
        let state = self.state.lock().await;
        self.enforce(&state, None).await
    }

    /// Whether the authority acknowledged the current deactivation.
    ///
    /// An unreadable flag counts as unconfirmed so the confirmation is sent
    /// again.
    pub fn deactivation_confirmed(&self) -> bool {
        match get_json::<bool>(self.store.as_ref(), DEACTIVATION_CONFIRMED_KEY) {
            Ok(confirmed) => confirmed.unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "deactivation confirmation flag unreadable");
                false
            }
        }
    }

    pub fn mark_deactivation_confirmed(&self) -> Result<(), TransitionError> {
        set_json(self.store.as_ref(), DEACTIVATION_CONFIRMED_KEY, &true)?;
        Ok(())
    }

    /// Whether the most recent executor call succeeded.
    pub fn last_enforcement_succeeded(&self) -> bool {
        self.last_enforcement_ok.load(Ordering::SeqCst)
    }

    /// Applies a directive from the remote authority.
    ///
    /// While a local tamper lock is active, directives issued before the
    /// tamper detection (or carrying no timestamp) are refused with
    /// [`TransitionError::Stale`]. A deactivation carrying the override flag
    /// is always applied.
    pub async fn apply_directive(&self, directive: Directive) -> Result<Transition, TransitionError> {
        let mut state = self.state.lock().await;
        if state.is_terminal() {
            return Err(TransitionError::Terminal);
        }

        if let Some(tamper_at) = tamper_horizon(&state).filter(|_| !directive.deactivation_override) {
            let stale = directive
                .directive_timestamp
                .is_none_or(|issued| issued < tamper_at);
            if stale {
                let conflict = DirectiveConflict {
                    requested_mode: directive.lock_mode,
                    directive_timestamp: directive.directive_timestamp,
                    tamper_detected_at: tamper_at,
                };
                info!(%conflict, "discarding stale directive");
                return Err(TransitionError::Stale(conflict));
            }
        }

        if let Some(token) = &directive.unlock_token {
            set_json(self.store.as_ref(), UNLOCK_TOKEN_KEY, token)?;
        }

        let now = self.clock.now();
        if directive.is_deactivation() {
            let next = LockState {
                mode: LockMode::Unlocked,
                reason_category: ReasonCategory::Deactivation,
                reason_text: directive.reason_text,
                applied_at: now,
                source_authority: Authority::Remote,
                directive_timestamp: directive.directive_timestamp,
                tamper_detected_at: None,
            };
            self.store.remove(DEACTIVATION_CONFIRMED_KEY)?;
            let transition = self.commit(&mut state, next, true, None).await?;
            if let Err(e) = self.store.remove(UNLOCK_TOKEN_KEY) {
                warn!(error = %e, "failed to clear unlock token");
            }
            info!(enforced = transition.enforced, "device deactivated");
            return Ok(transition);
        }

        if state.same_assertion(directive.lock_mode, directive.reason_category) {
            let next = LockState {
                reason_text: directive.reason_text,
                source_authority: Authority::Remote,
                directive_timestamp: directive.directive_timestamp.or(state.directive_timestamp),
                tamper_detected_at: None,
                ..state.clone()
            };
            debug!(mode = %next.mode, "directive reaffirms current state");
            return self.commit(&mut state, next, false, None).await;
        }

        let next = LockState {
            mode: directive.lock_mode,
            reason_category: directive.reason_category,
            reason_text: directive.reason_text,
            applied_at: now,
            source_authority: Authority::Remote,
            directive_timestamp: directive.directive_timestamp,
            tamper_detected_at: None,
        };
        let transition = self
            .commit(&mut state, next, true, directive.unlock_token.as_deref())
            .await?;
        info!(
            from = %transition.from.mode,
            to = %transition.to.mode,
            reason = %transition.to.reason_category,
            "lock state changed by remote directive"
        );
        Ok(transition)
    }

    /// Applies a locally detected tamper event without waiting for the network.
    ///
    /// Events below the configured threshold leave the state untouched. If
    /// persisting fails the lock is still enforced and the error returned.
    pub async fn apply_tamper(&self, event: &TamperEvent) -> Result<Transition, TransitionError> {
        let mut state = self.state.lock().await;
        if state.is_terminal() {
            return Err(TransitionError::Terminal);
        }
        if event.severity < self.tamper_threshold {
            debug!(severity = ?event.severity, kind = %event.tamper_type, "tamper event below lock threshold");
            return Ok(Transition {
                from: state.clone(),
                to: state.clone(),
                enforced: false,
            });
        }

        if state.is_tamper_locked() {
            // Later detections push the staleness horizon forward.
            let latest = state
                .tamper_detected_at
                .map_or(event.detected_at, |at| at.max(event.detected_at));
            let next = LockState {
                tamper_detected_at: Some(latest),
                ..state.clone()
            };
            return self.commit(&mut state, next, false, None).await;
        }

        let next = LockState {
            mode: LockMode::HardLocked,
            reason_category: ReasonCategory::Tamper,
            reason_text: event.description.clone(),
            applied_at: self.clock.now(),
            source_authority: Authority::Local,
            directive_timestamp: None,
            tamper_detected_at: Some(event.detected_at),
        };

        let from = state.clone();
        let persisted = self.persist(&next);
        let enforced = self.enforce(&next, None).await;
        *state = next.clone();
        self.updates.send_replace(next.clone());
        warn!(
            kind = %event.tamper_type,
            severity = ?event.severity,
            enforced,
            "tamper detected, device hard locked"
        );
        persisted?;
        Ok(Transition {
            from,
            to: next,
            enforced,
        })
    }

    /// Locks the device for a local administrative reason.
    ///
    /// Local events can only raise enforcement. A tamper lock is never
    /// replaced.
    pub async fn apply_admin_lock(
        &self,
        mode: LockMode,
        reason_text: &str,
    ) -> Result<Transition, TransitionError> {
        let mut state = self.state.lock().await;
        if state.is_terminal() {
            return Err(TransitionError::Terminal);
        }
        if !mode.is_locked() {
            return Err(TransitionError::UnlockRequiresToken);
        }
        if state.is_tamper_locked() {
            return Err(TransitionError::TamperLocked);
        }

        let next = LockState {
            mode,
            reason_category: ReasonCategory::Admin,
            reason_text: reason_text.to_string(),
            applied_at: self.clock.now(),
            source_authority: Authority::Local,
            directive_timestamp: None,
            tamper_detected_at: None,
        };
        let enforce = !state.same_assertion(mode, ReasonCategory::Admin);
        let transition = self.commit(&mut state, next, enforce, None).await?;
        info!(mode = %mode, "administrative lock applied");
        Ok(transition)
    }

    /// Unlocks with the token the authority issued in an earlier directive.
    ///
    /// The token is single use. Tamper locks cannot be lifted this way.
    pub async fn unlock_with_token(&self, token: &str) -> Result<Transition, TransitionError> {
        let mut state = self.state.lock().await;
        if state.is_terminal() {
            return Err(TransitionError::Terminal);
        }
        if state.reason_category == ReasonCategory::Tamper {
            return Err(TransitionError::TamperLocked);
        }
        if !state.mode.is_locked() {
            return Ok(Transition {
                from: state.clone(),
                to: state.clone(),
                enforced: false,
            });
        }

        let expected = get_json::<String>(self.store.as_ref(), UNLOCK_TOKEN_KEY)?;
        if expected.as_deref() != Some(token) {
            warn!("offline unlock rejected");
            return Err(TransitionError::InvalidUnlockToken);
        }

        let next = LockState {
            mode: LockMode::Unlocked,
            reason_category: ReasonCategory::None,
            reason_text: "unlocked with offline token".into(),
            applied_at: self.clock.now(),
            source_authority: Authority::Local,
            directive_timestamp: state.directive_timestamp,
            tamper_detected_at: None,
        };
        let transition = self.commit(&mut state, next, true, Some(token)).await?;
        self.store.remove(UNLOCK_TOKEN_KEY)?;
        info!("device unlocked with offline token");
        Ok(transition)
    }

    /// Leaves the terminal state after the device has been re-registered.
    pub async fn reactivate(&self) -> Result<Transition, TransitionError> {
        let mut state = self.state.lock().await;
        if !state.is_terminal() {
            return Ok(Transition {
                from: state.clone(),
                to: state.clone(),
                enforced: false,
            });
        }
        let next = LockState::initial(self.clock.now());
        let transition = self.commit(&mut state, next, false, None).await?;
        if let Err(e) = self.store.remove(DEACTIVATION_CONFIRMED_KEY) {
            warn!(error = %e, "failed to clear deactivation confirmation");
        }
        info!("device reactivated");
        Ok(transition)
    }

    /// Persists `next`, optionally enforces it, then publishes it.
    async fn commit(
        &self,
        state: &mut LockState,
        next: LockState,
        enforce: bool,
        unlock_token: Option<&str>,
    ) -> Result<Transition, TransitionError> {
        self.persist(&next)?;
        let enforced = enforce && self.enforce(&next, unlock_token).await;
        let from = std::mem::replace(state, next.clone());
        self.updates.send_replace(next.clone());
        Ok(Transition {
            from,
            to: next,
            enforced,
        })
    }

    fn persist(&self, next: &LockState) -> Result<(), TransitionError> {
        set_json(self.store.as_ref(), LOCK_STATE_KEY, next)?;
        if let Err(e) = set_json(self.store.as_ref(), LOCK_STATE_SHADOW_KEY, next) {
            warn!(error = %e, "lock state shadow write failed");
        }
        Ok(())
    }

    async fn enforce(&self, state: &LockState, unlock_token: Option<&str>) -> bool {
        let ok = enforce_state(self.executor.as_ref(), state, unlock_token).await;
        self.last_enforcement_ok.store(ok, Ordering::SeqCst);
        ok
    }
}

/// Drives the executor to match `state`. Returns whether it succeeded.
async fn enforce_state(
    executor: &dyn EnforcementExecutor,
    state: &LockState,
    unlock_token: Option<&str>,
) -> bool {
    let result = if state.is_terminal() {
        executor.apply_deactivation().await
    } else if state.mode.is_locked() {
        executor
            .apply_lock(state.mode, state.reason_category, &state.reason_text)
            .await
    } else {
        executor.apply_unlock(unlock_token).await
    };

    match result {
        Ok(()) => true,
        Err(e) => {
            error!(mode = %state.mode, reason = %state.reason_category, error = %e, "enforcement failed");
            false
        }
    }
}

/// Detection time of the active local tamper lock, if there is one.
fn tamper_horizon(state: &LockState) -> Option<Timestamp> {
    state
        .is_tamper_locked()
        .then(|| state.tamper_detected_at.unwrap_or(state.applied_at))
}
