//! Remote authority transport abstraction.
//!
//! The engine only knows that a report goes out and a [`Directive`] comes
//! back. [`crate::http::HttpRemoteClient`] is the production implementation.

use crate::error::SyncResult;
use crate::identity::DeviceIdentity;
use async_trait::async_trait;
use custodian_types::{Directive, StateSnapshot};
use serde::{Deserialize, Serialize};

/// Outcome of local deactivation teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeactivationStatus {
    Success,
    Failed,
}

/// Sent to the authority once teardown has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivationReport {
    pub status: DeactivationStatus,
    pub message: String,
}

impl DeactivationReport {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: DeactivationStatus::Success,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: DeactivationStatus::Failed,
            message: message.into(),
        }
    }
}

/// Talks to the remote authority.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Delivers a state report and returns the authority's directive.
    ///
    /// `retry_count` is the number of earlier failed attempts for the same
    /// report, zero for a live heartbeat.
    async fn send(
        &self,
        identity: &DeviceIdentity,
        snapshot: &StateSnapshot,
        retry_count: u32,
    ) -> SyncResult<Directive>;

    /// Acknowledges that a deactivation command has been carried out.
    async fn confirm_deactivation(
        &self,
        identity: &DeviceIdentity,
        report: &DeactivationReport,
    ) -> SyncResult<()>;
}

/// In-process test doubles.
pub mod mock {
    use super::*;
    use crate::error::SyncError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Ordered log of calls shared between doubles, for asserting
    /// cross-component ordering.
    #[derive(Debug, Default)]
    pub struct CallJournal {
        entries: Mutex<Vec<String>>,
    }

    impl CallJournal {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn record(&self, entry: impl Into<String>) {
            self.entries.lock().unwrap().push(entry.into());
        }

        pub fn entries(&self) -> Vec<String> {
            self.entries.lock().unwrap().clone()
        }

        /// Index of the first entry starting with `prefix`.
        pub fn position(&self, prefix: &str) -> Option<usize> {
            self.entries
                .lock()
                .unwrap()
                .iter()
                .position(|e| e.starts_with(prefix))
        }
    }

    /// A report received by [`MockRemoteClient`].
    #[derive(Debug, Clone, PartialEq)]
    pub struct SentReport {
        pub device_id: String,
        pub snapshot: StateSnapshot,
        pub retry_count: u32,
    }

    /// Scripted remote authority.
    ///
    /// Queued responses are consumed first. Once the queue is empty the
    /// client answers with the default directive, or a network error while
    /// offline.
    pub struct MockRemoteClient {
        scripted: Mutex<VecDeque<SyncResult<Directive>>>,
        default_directive: Mutex<Directive>,
        offline: AtomicBool,
        delay: Mutex<Duration>,
        sent: Mutex<Vec<SentReport>>,
        confirmations: Mutex<Vec<DeactivationReport>>,
        journal: Option<Arc<CallJournal>>,
    }

    impl MockRemoteClient {
        pub fn new() -> Self {
            Self {
                scripted: Mutex::new(VecDeque::new()),
                default_directive: Mutex::new(Directive::unlock()),
                offline: AtomicBool::new(false),
                delay: Mutex::new(Duration::ZERO),
                sent: Mutex::new(Vec::new()),
                confirmations: Mutex::new(Vec::new()),
                journal: None,
            }
        }

        pub fn with_journal(mut self, journal: Arc<CallJournal>) -> Self {
            self.journal = Some(journal);
            self
        }

        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        pub fn set_default(&self, directive: Directive) {
            *self.default_directive.lock().unwrap() = directive;
        }

        /// Simulated round-trip time, applied before answering.
        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = delay;
        }

        pub fn push_response(&self, response: SyncResult<Directive>) {
            self.scripted.lock().unwrap().push_back(response);
        }

        pub fn sent(&self) -> Vec<SentReport> {
            self.sent.lock().unwrap().clone()
        }

        pub fn send_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        pub fn confirmations(&self) -> Vec<DeactivationReport> {
            self.confirmations.lock().unwrap().clone()
        }

        fn journal(&self, entry: &str) {
            if let Some(journal) = &self.journal {
                journal.record(entry);
            }
        }
    }

    impl Default for MockRemoteClient {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl RemoteClient for MockRemoteClient {
        async fn send(
            &self,
            identity: &DeviceIdentity,
            snapshot: &StateSnapshot,
            retry_count: u32,
        ) -> SyncResult<Directive> {
            self.journal("send:start");
            self.sent.lock().unwrap().push(SentReport {
                device_id: identity.id.clone(),
                snapshot: snapshot.clone(),
                retry_count,
            });

            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let scripted = self.scripted.lock().unwrap().pop_front();
            let result = match scripted {
                Some(result) => result,
                None if self.offline.load(Ordering::SeqCst) => {
                    Err(SyncError::Network("authority unreachable".into()))
                }
                None => Ok(self.default_directive.lock().unwrap().clone()),
            };
            self.journal(if result.is_ok() { "send:ok" } else { "send:err" });
            result
        }

        async fn confirm_deactivation(
            &self,
            _identity: &DeviceIdentity,
            report: &DeactivationReport,
        ) -> SyncResult<()> {
            self.journal("confirm_deactivation");
            if self.offline.load(Ordering::SeqCst) {
                return Err(SyncError::Network("authority unreachable".into()));
            }
            self.confirmations.lock().unwrap().push(report.clone());
            Ok(())
        }
    }
}
