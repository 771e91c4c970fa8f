//! Reconciling the local replica with its remote.
//!
//! A pass has two phases: `pull` talks to the remote without touching the local file,
//! then the delta is applied while the pool's file gate is held exclusively, so no
//! statement ever observes a half-applied pass. Passes never overlap.

mod protocol;
mod scheduler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use protocol::{EmbeddedReplica, SyncDelta, SyncProtocol, SyncRequest, open_local};
pub(crate) use scheduler::SyncScheduler;
pub use scheduler::SyncPolicy;

use crate::config::SyncConcurrency;
use crate::endpoint::Endpoint;
use crate::error::ReplicaDbError;
use crate::executor::apply_statements;
use crate::pool::{FileGate, ReplicaManager};

/// Outcome of the most recent pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncResult {
    #[default]
    Never,
    Success,
    Failure { reason: String },
}

/// Process-wide sync bookkeeping. Starts as "never synced" and is not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncState {
    /// Completion time of the last successful pass
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_result: SyncResult,
    pub in_progress: bool,
    /// Cursor handed to the remote on the next pass
    pub frame_no: Option<u64>,
    /// Number of passes that reached the remote protocol
    pub passes: u64,
}

impl SyncState {
    #[must_use]
    pub fn never_synced(&self) -> bool {
        self.last_sync_time.is_none()
    }

    /// `Ok(self)` if the last pass succeeded, otherwise the failure as `SyncError`.
    ///
    /// # Errors
    /// Returns `ReplicaDbError::SyncError` carrying the recorded failure reason.
    pub fn into_outcome(self) -> Result<SyncState, ReplicaDbError> {
        match &self.last_result {
            SyncResult::Failure { reason } => Err(ReplicaDbError::SyncError(reason.clone())),
            SyncResult::Never => Err(ReplicaDbError::SyncError(
                "sync pass did not complete".into(),
            )),
            SyncResult::Success => Ok(self),
        }
    }
}

/// What the apply phase did.
struct Applied {
    frame_no: Option<u64>,
    frames: usize,
}

enum Role {
    Leader(watch::Sender<Option<SyncState>>),
    Follower(watch::Receiver<Option<SyncState>>),
}

/// Runs and serializes sync passes for one endpoint.
pub struct ReplicaSyncer {
    endpoint: Arc<Endpoint>,
    protocol: Option<Arc<dyn SyncProtocol>>,
    manager: ReplicaManager,
    gate: FileGate,
    concurrency: SyncConcurrency,
    state: Mutex<SyncState>,
    inflight: Mutex<Option<watch::Receiver<Option<SyncState>>>>,
    pass_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ReplicaSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSyncer")
            .field("endpoint", &self.endpoint)
            .field("protocol", &self.protocol.as_ref().map(|p| p.name()))
            .field("concurrency", &self.concurrency)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ReplicaSyncer {
    pub(crate) fn new(
        endpoint: Arc<Endpoint>,
        protocol: Option<Arc<dyn SyncProtocol>>,
        manager: ReplicaManager,
        gate: FileGate,
        concurrency: SyncConcurrency,
    ) -> Self {
        Self {
            endpoint,
            protocol,
            manager,
            gate,
            concurrency,
            state: Mutex::new(SyncState::default()),
            inflight: Mutex::new(None),
            pass_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Snapshot of the current sync state.
    #[must_use]
    pub fn state(&self) -> SyncState {
        lock(&self.state).clone()
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.protocol.is_some()
    }

    /// Run one pass, or join the one already running (see [`SyncConcurrency`]).
    ///
    /// # Errors
    /// Returns `ReplicaDbError::SyncError` if sync is disabled, the remote fails, or the
    /// delta cannot be applied (the local file is left as it was), and
    /// `ReplicaDbError::ConnectionError` once the pool has been closed.
    pub async fn sync(&self) -> Result<SyncState, ReplicaDbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReplicaDbError::ConnectionError("pool closed".into()));
        }
        let Some(protocol) = self.protocol.as_ref() else {
            return Err(ReplicaDbError::SyncError(
                "sync disabled: endpoint has no remote_url".into(),
            ));
        };

        match self.concurrency {
            SyncConcurrency::Join => self.sync_joined(protocol.as_ref()).await,
            SyncConcurrency::Queue => {
                let _turn = self.pass_lock.lock().await;
                self.run_pass(protocol.as_ref()).await.into_outcome()
            }
        }
    }

    async fn sync_joined(&self, protocol: &dyn SyncProtocol) -> Result<SyncState, ReplicaDbError> {
        let role = {
            let mut slot = lock(&self.inflight);
            match slot.as_ref() {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                debug!(endpoint = %self.endpoint.local_path().display(), "joining in-flight sync pass");
                let outcome = rx
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| {
                        ReplicaDbError::SyncError("in-flight sync pass was abandoned".into())
                    })?
                    .clone();
                outcome
                    .ok_or_else(|| ReplicaDbError::SyncError("sync pass produced no state".into()))?
                    .into_outcome()
            }
            Role::Leader(tx) => {
                let _slot = InflightSlot(&self.inflight);
                let _turn = self.pass_lock.lock().await;
                let snapshot = self.run_pass(protocol).await;
                tx.send_replace(Some(snapshot.clone()));
                snapshot.into_outcome()
            }
        }
    }

    /// One full pass. Caller holds `pass_lock`.
    async fn run_pass(&self, protocol: &dyn SyncProtocol) -> SyncState {
        let cursor = {
            let mut state = lock(&self.state);
            state.in_progress = true;
            state.frame_no
        };
        let _progress = InProgress(&self.state);

        let outcome = self.pull_and_apply(protocol, cursor).await;

        let mut state = lock(&self.state);
        state.in_progress = false;
        state.passes += 1;
        match outcome {
            Ok(applied) => {
                state.last_sync_time = Some(Utc::now());
                state.last_result = SyncResult::Success;
                if applied.frame_no.is_some() {
                    state.frame_no = applied.frame_no;
                }
                info!(
                    protocol = protocol.name(),
                    frame_no = ?state.frame_no,
                    frames = applied.frames,
                    passes = state.passes,
                    "sync pass complete"
                );
            }
            Err(err) => {
                let reason = err.sync_reason();
                warn!(
                    protocol = protocol.name(),
                    passes = state.passes,
                    %reason,
                    "sync pass failed; local replica left at last good state"
                );
                state.last_result = SyncResult::Failure { reason };
            }
        }
        state.clone()
    }

    async fn pull_and_apply(
        &self,
        protocol: &dyn SyncProtocol,
        cursor: Option<u64>,
    ) -> Result<Applied, ReplicaDbError> {
        let remote = self.endpoint.remote().ok_or_else(|| {
            ReplicaDbError::SyncError("sync disabled: endpoint has no remote_url".into())
        })?;

        let delta = protocol.pull(SyncRequest { cursor, remote }).await?;

        match delta {
            SyncDelta::UpToDate => Ok(Applied {
                frame_no: None,
                frames: 0,
            }),
            SyncDelta::Statements { batch, frame_no } => {
                let _exclusive = self.gate.exclusive().await;
                let session = self.manager.open_session().await.map_err(|e| {
                    ReplicaDbError::SyncError(format!("cannot open apply session: {e}"))
                })?;
                let conn = session.connection()?;
                apply_statements(&conn, &batch)
                    .await
                    .map_err(|e| ReplicaDbError::SyncError(format!("delta apply failed: {e}")))?;
                Ok(Applied {
                    frame_no,
                    frames: batch.len(),
                })
            }
            SyncDelta::Replicate => {
                let _exclusive = self.gate.exclusive().await;
                self.replicate().await
            }
        }
    }

    #[cfg(feature = "replication")]
    async fn replicate(&self) -> Result<Applied, ReplicaDbError> {
        let replicated = self
            .manager
            .database()
            .sync()
            .await
            .map_err(|e| ReplicaDbError::SyncError(format!("replication failed: {e}")))?;
        Ok(Applied {
            frame_no: replicated.frame_no(),
            frames: replicated.frames_synced(),
        })
    }

    #[cfg(not(feature = "replication"))]
    async fn replicate(&self) -> Result<Applied, ReplicaDbError> {
        Err(ReplicaDbError::SyncError(
            "embedded replication requires the `replication` feature".into(),
        ))
    }

    /// Refuse new passes and wait for the running one to finish.
    pub(crate) async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let _turn = self.pass_lock.lock().await;
    }
}

/// Clears the in-flight slot when the leading pass ends, including on cancellation.
struct InflightSlot<'a>(&'a Mutex<Option<watch::Receiver<Option<SyncState>>>>);

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        lock(self.0).take();
    }
}

struct InProgress<'a>(&'a Mutex<SyncState>);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        lock(self.0).in_progress = false;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
