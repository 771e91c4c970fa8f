use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use deadpool::managed::{Manager, Metrics, RecycleError, RecycleResult};
use libsql::{Connection, Database};
use tracing::{debug, warn};

use crate::error::ReplicaDbError;

/// One libsql connection to the local file, owned by the pool.
pub struct Session {
    id: u64,
    link: Arc<SessionLink>,
    broken: bool,
}

impl Session {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// # Errors
    /// Returns `ReplicaDbError::ConnectionError` once the connection has been severed.
    pub(crate) fn connection(&self) -> Result<Connection, ReplicaDbError> {
        self.link
            .connection()
            .ok_or_else(|| ReplicaDbError::ConnectionError("session closed".into()))
    }

    pub(crate) fn link(&self) -> Arc<SessionLink> {
        Arc::clone(&self.link)
    }

    pub(crate) fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

/// The live connection behind a [`Session`]. The pool keeps a second reference so it can
/// close the connection of a handle that was never returned.
pub(crate) struct SessionLink {
    live: Mutex<Option<LiveConnection>>,
}

struct LiveConnection {
    conn: Connection,
    _open: OpenSession,
}

impl SessionLink {
    fn connection(&self) -> Option<Connection> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|live| live.conn.clone())
    }

    /// Close the connection. Clones held by a statement still running keep it alive
    /// until that statement finishes. Returns `false` if it was already closed.
    pub(crate) fn sever(&self) -> bool {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner).take();
        live.is_some()
    }
}

/// Keeps the open-session count honest: decremented whenever a session is dropped,
/// whichever path dropped it.
struct OpenSession(Arc<AtomicUsize>);

impl Drop for OpenSession {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct ManagerInner {
    database: Database,
    busy_timeout: Duration,
    next_id: AtomicU64,
    open: Arc<AtomicUsize>,
}

/// deadpool manager creating and health-checking [`Session`]s.
///
/// The only place sessions on the local file are created.
#[derive(Clone)]
pub(crate) struct ReplicaManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ReplicaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaManager")
            .field("open_sessions", &self.open_sessions())
            .field("sessions_created", &self.sessions_created())
            .finish()
    }
}

impl ReplicaManager {
    pub(crate) fn new(database: Database, busy_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                database,
                busy_timeout,
                next_id: AtomicU64::new(1),
                open: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub(crate) fn database(&self) -> &Database {
        &self.inner.database
    }

    pub(crate) fn open_sessions(&self) -> usize {
        self.inner.open.load(Ordering::Acquire)
    }

    pub(crate) fn sessions_created(&self) -> u64 {
        self.inner.next_id.load(Ordering::Acquire) - 1
    }

    pub(crate) async fn open_session(&self) -> Result<Session, ReplicaDbError> {
        let conn = self.inner.database.connect().map_err(|e| {
            ReplicaDbError::ConnectionError(format!("Failed to open session: {e}"))
        })?;
        // Replica connections may refuse local pragmas; the default busy handler is still usable.
        let pragma = format!("PRAGMA busy_timeout = {}", self.inner.busy_timeout.as_millis());
        match conn.query(&pragma, ()).await {
            Ok(mut rows) => {
                let _ = rows.next().await;
            }
            Err(e) => debug!(error = %e, "busy_timeout not applied"),
        }

        self.inner.open.fetch_add(1, Ordering::AcqRel);
        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel);
        debug!(session = id, "session opened");
        Ok(Session {
            id,
            link: Arc::new(SessionLink {
                live: Mutex::new(Some(LiveConnection {
                    conn,
                    _open: OpenSession(Arc::clone(&self.inner.open)),
                })),
            }),
            broken: false,
        })
    }
}

impl Manager for ReplicaManager {
    type Type = Session;
    type Error = ReplicaDbError;

    async fn create(&self) -> Result<Session, ReplicaDbError> {
        self.open_session().await
    }

    async fn recycle(&self, session: &mut Session, _metrics: &Metrics) -> RecycleResult<ReplicaDbError> {
        if session.broken {
            debug!(session = session.id, "discarding session marked broken");
            return Err(RecycleError::Backend(ReplicaDbError::ConnectionError(
                "session marked broken".into(),
            )));
        }

        let conn = session.connection().map_err(RecycleError::Backend)?;

        // A handle dropped outside a runtime cannot roll back; do it before lending the session again.
        if !conn.is_autocommit() {
            warn!(session = session.id, "rolling back transaction left open on recycled session");
            conn.execute("ROLLBACK", ())
                .await
                .map_err(|e| RecycleError::Backend(ReplicaDbError::ConnectionError(e.to_string())))?;
        }

        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(|e| RecycleError::Backend(ReplicaDbError::ConnectionError(e.to_string())))?;
        rows.next()
            .await
            .map_err(|e| RecycleError::Backend(ReplicaDbError::ConnectionError(e.to_string())))?;
        Ok(())
    }
}
