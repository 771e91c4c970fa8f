//! The pool of sessions on the local replica and its lifecycle.

mod gate;
mod handle;
mod lifecycle;
mod manager;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use deadpool::Runtime;
use deadpool::managed::{Pool, PoolError, TimeoutType, Timeouts};
use futures_util::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use handle::ConnectionHandle;
pub use manager::Session;

pub(crate) use gate::FileGate;
use handle::PoolShared;
pub(crate) use manager::ReplicaManager;

use crate::config::{ReplicaOptions, ReplicaOptionsBuilder};
use crate::endpoint::Endpoint;
use crate::error::ReplicaDbError;
use crate::scope;
use crate::sync::{EmbeddedReplica, ReplicaSyncer, SyncProtocol, SyncScheduler, SyncState, open_local};
use lifecycle::Lifecycle;

/// Pause between attempts when a new session fails to open during `acquire`.
const REOPEN_BACKOFF: Duration = Duration::from_millis(25);

/// Outcome of [`ReplicaPool::drain_and_close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Every lent handle came back before the shutdown timeout.
    pub released_cleanly: bool,
    /// Handles still lent out when the shutdown timeout expired. Their next access fails
    /// with `ConnectionError("pool closing")`.
    pub forced: usize,
}

struct PoolInner {
    sessions: Pool<ReplicaManager>,
    manager: ReplicaManager,
    shared: Arc<PoolShared>,
    syncer: Arc<ReplicaSyncer>,
    scheduler: tokio::sync::Mutex<Option<SyncScheduler>>,
    endpoint: Arc<Endpoint>,
    options: ReplicaOptions,
}

/// Bounded pool of sessions on a local replica, plus the syncer that keeps it current.
///
/// Construct one per process with [`ReplicaPool::initialize`] and pass it (cheaply cloned)
/// to request handlers; call [`drain_and_close`](Self::drain_and_close) once at shutdown.
#[derive(Clone)]
pub struct ReplicaPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ReplicaPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaPool")
            .field("options", &self.inner.options)
            .field("in_use", &self.in_use())
            .field("manager", &self.inner.manager)
            .finish_non_exhaustive()
    }
}

impl ReplicaPool {
    #[must_use]
    pub fn builder(local_path: impl Into<std::path::PathBuf>) -> ReplicaOptionsBuilder {
        ReplicaOptionsBuilder::new(local_path)
    }

    /// Open (creating if absent) the local file, sync once if a remote is configured, and
    /// start lending sessions.
    ///
    /// # Errors
    /// Returns `ReplicaDbError::ConfigError` for invalid options,
    /// `ReplicaDbError::ConnectionError` if the local file cannot be opened, and
    /// `ReplicaDbError::SyncError` if the first pass fails while `sync_before_serve` is set.
    pub async fn initialize(options: ReplicaOptions) -> Result<Self, ReplicaDbError> {
        options.validate()?;
        let endpoint = Arc::new(options.endpoint.clone());
        ensure_parent_dir(endpoint.local_path()).await?;

        let protocol: Option<Arc<dyn SyncProtocol>> = if endpoint.sync_enabled() {
            Some(
                options
                    .sync_protocol
                    .clone()
                    .unwrap_or_else(|| Arc::new(EmbeddedReplica::new())),
            )
        } else {
            if options.sync_protocol.is_some() {
                warn!("sync protocol configured without a remote endpoint; sync stays disabled");
            }
            None
        };

        let database = match &protocol {
            Some(protocol) => protocol.open(&endpoint).await?,
            None => open_local(&endpoint).await?,
        };
        let manager = ReplicaManager::new(database, options.busy_timeout);

        {
            // Smoke test; also switches plain local files to WAL so readers run alongside the writer.
            let session = manager.open_session().await?;
            let conn = session.connection()?;
            match conn.query("PRAGMA journal_mode = WAL", ()).await {
                Ok(mut rows) => match rows.next().await {
                    Ok(Some(row)) => {
                        let mode = row.get::<String>(0).unwrap_or_default();
                        if !mode.eq_ignore_ascii_case("wal") {
                            warn!(journal_mode = %mode, "local file is not in WAL mode");
                        }
                    }
                    Ok(None) => warn!("journal_mode pragma returned no row"),
                    Err(e) => warn!(error = %e, "journal_mode pragma failed"),
                },
                Err(e) => warn!(error = %e, "WAL journal mode not applied"),
            }
        }

        let gate = FileGate::new();
        let syncer = Arc::new(ReplicaSyncer::new(
            Arc::clone(&endpoint),
            protocol,
            manager.clone(),
            gate.clone(),
            options.sync_concurrency,
        ));

        if syncer.enabled() {
            match syncer.sync().await {
                Ok(state) => info!(frame_no = ?state.frame_no, "initial sync complete"),
                Err(err) if options.sync_before_serve => return Err(err),
                Err(err) => warn!(error = %err, "initial sync failed; serving the stale local copy"),
            }
        }

        let sessions = Pool::builder(manager.clone())
            .max_size(options.pool_size)
            .wait_timeout(Some(options.acquire_timeout))
            .create_timeout(Some(options.acquire_timeout))
            .recycle_timeout(Some(options.acquire_timeout))
            .runtime(Runtime::Tokio1)
            .build()?;

        let scheduler = if syncer.enabled() {
            SyncScheduler::spawn(Arc::clone(&syncer), options.sync_policy)
        } else {
            None
        };
        let write_trigger = scheduler.as_ref().and_then(SyncScheduler::write_trigger);

        let shared = Arc::new(PoolShared {
            gate,
            commit_mode: options.commit_mode,
            lifecycle: Lifecycle::new(),
            write_trigger,
            leases: std::sync::Mutex::new(HashMap::new()),
        });

        info!(
            path = %endpoint.local_path().display(),
            remote = endpoint.remote_url().unwrap_or("<none>"),
            pool_size = options.pool_size,
            commit_mode = ?options.commit_mode,
            "replica pool ready"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                sessions,
                manager,
                shared,
                syncer,
                scheduler: tokio::sync::Mutex::new(scheduler),
                endpoint,
                options,
            }),
        })
    }

    /// Borrow a session, waiting up to `acquire_timeout` for one to come free.
    ///
    /// Sessions that fail their health check are replaced before being handed out.
    ///
    /// # Errors
    /// Returns `ReplicaDbError::ConnectionError` with `"pool exhausted"` on timeout,
    /// `"pool closing"` / `"pool closed"` during or after shutdown, or the open failure if no
    /// session could be opened before the deadline.
    pub async fn acquire(&self) -> Result<ConnectionHandle, ReplicaDbError> {
        let shared = &self.inner.shared;
        shared.lifecycle.check_acquire()?;

        let deadline = Instant::now() + self.inner.options.acquire_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let timeouts = Timeouts {
                wait: Some(remaining),
                create: Some(remaining),
                recycle: Some(remaining),
            };

            match self.inner.sessions.timeout_get(&timeouts).await {
                Ok(session) => {
                    if let Err(err) = shared.lifecycle.check_acquire() {
                        drop(session);
                        return Err(err);
                    }
                    debug!(session = session.id(), "session acquired");
                    return Ok(ConnectionHandle::new(session, Arc::clone(shared)));
                }
                Err(PoolError::Timeout(TimeoutType::Wait)) => {
                    return Err(ReplicaDbError::ConnectionError("pool exhausted".into()));
                }
                Err(PoolError::Timeout(kind)) => {
                    return Err(ReplicaDbError::ConnectionError(format!(
                        "timed out preparing a session ({kind:?})"
                    )));
                }
                Err(PoolError::Closed) => {
                    return Err(ReplicaDbError::ConnectionError("pool closed".into()));
                }
                Err(PoolError::Backend(err)) => {
                    if Instant::now() + REOPEN_BACKOFF >= deadline {
                        return Err(err);
                    }
                    warn!(error = %err, "session failed to open; retrying");
                    tokio::time::sleep(REOPEN_BACKOFF).await;
                }
                Err(other) => {
                    return Err(ReplicaDbError::ConnectionError(other.to_string()));
                }
            }
        }
    }

    /// Return a handle to the pool. Idempotent.
    pub async fn release(&self, handle: &mut ConnectionHandle) {
        handle.release().await;
    }

    /// Run `f` with a borrowed handle. See [`scope::with_connection`].
    ///
    /// # Errors
    /// Whatever `acquire` or `f` return.
    pub async fn with_connection<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut ConnectionHandle) -> BoxFuture<'c, Result<T, E>>,
        E: From<ReplicaDbError>,
    {
        scope::with_connection(self, f).await
    }

    /// Run a sync pass now. See [`ReplicaSyncer::sync`].
    ///
    /// # Errors
    /// See [`ReplicaSyncer::sync`].
    pub async fn sync(&self) -> Result<SyncState, ReplicaDbError> {
        self.inner.syncer.sync().await
    }

    /// Wait for lent handles (up to `shutdown_timeout`), then close every session.
    ///
    /// Handles still out at the deadline are force-closed: their connection is closed,
    /// an open transaction is rolled back and the writer lock is freed. Stops scheduled
    /// syncing and lets a running pass finish first. Call once.
    ///
    /// # Errors
    /// Returns `ReplicaDbError::ConnectionError("pool closed")` if the pool is already
    /// draining or closed.
    pub async fn drain_and_close(&self) -> Result<DrainReport, ReplicaDbError> {
        let lifecycle = &self.inner.shared.lifecycle;
        if !lifecycle.begin_drain() {
            return Err(ReplicaDbError::ConnectionError("pool closed".into()));
        }
        let deadline = Instant::now() + self.inner.options.shutdown_timeout;
        info!(in_use = lifecycle.in_use(), "draining replica pool");

        if let Some(scheduler) = self.inner.scheduler.lock().await.take() {
            scheduler.stop(deadline).await;
        }

        let idle = lifecycle.wait_idle(deadline).await;
        let forced = if idle {
            0
        } else {
            lifecycle.close();
            self.inner.shared.revoke_outstanding()
        };
        if tokio::time::timeout_at(deadline, self.inner.syncer.shutdown())
            .await
            .is_err()
        {
            warn!("sync pass still running at shutdown deadline");
        }

        lifecycle.close();
        self.inner.sessions.close();

        if forced > 0 {
            warn!(forced, "handles still in use after shutdown timeout were force-closed");
        }
        info!(open_sessions = self.open_sessions(), "replica pool closed");
        Ok(DrainReport {
            released_cleanly: idle,
            forced,
        })
    }

    #[must_use]
    pub fn sync_state(&self) -> SyncState {
        self.inner.syncer.state()
    }

    #[must_use]
    pub fn syncer(&self) -> &Arc<ReplicaSyncer> {
        &self.inner.syncer
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    #[must_use]
    pub fn options(&self) -> &ReplicaOptions {
        &self.inner.options
    }

    /// Configured maximum number of sessions.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.options.pool_size
    }

    /// Handles currently lent out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.shared.lifecycle.in_use()
    }

    /// Sessions open on the local file, idle or lent out. Zero once the pool is closed and
    /// every handle has been dropped.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.inner.manager.open_sessions()
    }

    /// Sessions opened over the pool's lifetime, including replacements.
    #[must_use]
    pub fn sessions_created(&self) -> u64 {
        self.inner.manager.sessions_created()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.shared.lifecycle.is_open()
    }
}

async fn ensure_parent_dir(path: &Path) -> Result<(), ReplicaDbError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ReplicaDbError::ConnectionError(format!(
                    "Failed to create directory {}: {e}",
                    parent.display()
                ))
            })
        }
        _ => Ok(()),
    }
}
