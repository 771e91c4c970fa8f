use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use deadpool::managed::Object;
use libsql::Connection;
use tokio::sync::{Notify, OwnedRwLockReadGuard};
use tracing::{debug, warn};

use super::gate::{FileGate, WriteGuard};
use super::lifecycle::Lifecycle;
use super::manager::{ReplicaManager, SessionLink};
use crate::config::CommitMode;
use crate::error::ReplicaDbError;
use crate::executor;
use crate::results::QueryResult;
use crate::types::{QueryAndParams, RowValues};

/// State shared by the pool and every handle it lends out.
#[derive(Debug)]
pub(crate) struct PoolShared {
    pub(crate) gate: FileGate,
    pub(crate) commit_mode: CommitMode,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) write_trigger: Option<Arc<Notify>>,
    pub(crate) leases: Mutex<HashMap<u64, Arc<Lease>>>,
}

impl PoolShared {
    fn lend(&self, session_id: u64, lease: Arc<Lease>) {
        lock(&self.leases).insert(session_id, lease);
        self.lifecycle.checked_out();
    }

    fn give_back(&self, session_id: u64) {
        lock(&self.leases).remove(&session_id);
        self.lifecycle.checked_in();
    }

    /// Close the connection of every handle still lent out and drop any transaction it
    /// holds. Returns how many handles were cut off.
    pub(crate) fn revoke_outstanding(&self) -> usize {
        let leases: Vec<(u64, Arc<Lease>)> = lock(&self.leases).drain().collect();
        for (session_id, lease) in &leases {
            lease.revoke();
            warn!(session = session_id, "handle force-closed at shutdown");
        }
        leases.len()
    }
}

/// What the pool can take back from a lent handle: its connection and its open
/// transaction.
pub(crate) struct Lease {
    link: Arc<SessionLink>,
    tx: Mutex<Option<WriteGuard>>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("in_transaction", &lock(&self.tx).is_some())
            .finish_non_exhaustive()
    }
}

impl Lease {
    /// Closing the connection first rolls the transaction back before the writer lock goes.
    fn revoke(&self) {
        self.link.sever();
        lock(&self.tx).take();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lock held while one statement runs.
pub(crate) enum Access {
    Shared { _guard: OwnedRwLockReadGuard<()> },
    Write { _guard: WriteGuard },
    /// The handle's open transaction already holds the gate and the writer lock.
    InTransaction,
}

impl Access {
    pub(crate) fn commits_on_completion(&self) -> bool {
        matches!(self, Access::Write { .. })
    }
}

/// A session borrowed from the pool for one operation.
///
/// Returned to the pool by [`release`](Self::release) or on drop. In
/// [`CommitMode::Explicit`] an uncommitted transaction is rolled back on the way back.
pub struct ConnectionHandle {
    session: Option<Object<ReplicaManager>>,
    session_id: u64,
    shared: Arc<PoolShared>,
    lease: Arc<Lease>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("session", &self.session_id)
            .field("released", &self.session.is_none())
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

impl ConnectionHandle {
    pub(crate) fn new(session: Object<ReplicaManager>, shared: Arc<PoolShared>) -> Self {
        let session_id = session.id();
        let lease = Arc::new(Lease {
            link: session.link(),
            tx: Mutex::new(None),
        });
        shared.lend(session_id, Arc::clone(&lease));
        Self {
            session_id,
            session: Some(session),
            shared,
            lease,
        }
    }

    /// Id of the underlying session, unique for the pool's lifetime.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.session_id
    }

    #[must_use]
    pub fn commit_mode(&self) -> CommitMode {
        self.shared.commit_mode
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        lock(&self.lease.tx).is_some()
    }

    fn take_tx(&self) -> Option<WriteGuard> {
        lock(&self.lease.tx).take()
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.session.is_none()
    }

    /// Close the session instead of returning it to the pool; the pool opens a fresh one
    /// on demand. Use after a driver-level failure that may have left the session unusable.
    pub fn discard_on_release(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.mark_broken();
        }
    }

    pub(crate) fn connection(&self) -> Result<Connection, ReplicaDbError> {
        let session = self.session.as_ref().ok_or_else(|| {
            ReplicaDbError::ConnectionError("handle already released".into())
        })?;
        self.shared.lifecycle.check_access()?;
        session.connection()
    }

    pub(crate) async fn read_access(&self) -> Result<Access, ReplicaDbError> {
        self.connection()?;
        if self.in_transaction() {
            return Ok(Access::InTransaction);
        }
        let guard = self.shared.gate.read().await;
        self.shared.lifecycle.check_access()?;
        Ok(Access::Shared { _guard: guard })
    }

    /// Writer access for one write statement. In explicit mode the first write opens the
    /// handle's transaction, which keeps the writer lock until commit or rollback.
    pub(crate) async fn write_access(&mut self) -> Result<Access, ReplicaDbError> {
        let conn = self.connection()?;
        if self.in_transaction() {
            return Ok(Access::InTransaction);
        }

        let guard = self.shared.gate.write().await;
        self.shared.lifecycle.check_access()?;
        match self.shared.commit_mode {
            CommitMode::Autocommit => Ok(Access::Write { _guard: guard }),
            CommitMode::Explicit => {
                conn.execute("BEGIN IMMEDIATE", ())
                    .await
                    .map_err(|e| ReplicaDbError::query("BEGIN IMMEDIATE", e))?;
                debug!(session = self.session_id, "transaction opened");
                *lock(&self.lease.tx) = Some(guard);
                Ok(Access::InTransaction)
            }
        }
    }

    pub(crate) fn write_committed(&self) {
        if let Some(trigger) = &self.shared.write_trigger {
            trigger.notify_one();
        }
    }

    /// Commit the open transaction. A no-op when nothing is pending.
    ///
    /// # Errors
    /// Returns `ReplicaDbError::QueryError` if `COMMIT` fails; the transaction is then
    /// rolled back and its writes are lost.
    pub async fn commit(&mut self) -> Result<(), ReplicaDbError> {
        let Some(tx) = self.take_tx() else {
            return Ok(());
        };
        let conn = self.connection()?;
        if let Err(e) = conn.execute("COMMIT", ()).await {
            warn!(session = self.session_id, error = %e, "commit failed; rolling back");
            if conn.execute("ROLLBACK", ()).await.is_err() {
                self.discard_on_release();
            }
            drop(tx);
            return Err(ReplicaDbError::query("COMMIT", e));
        }
        drop(tx);
        debug!(session = self.session_id, "transaction committed");
        self.write_committed();
        Ok(())
    }

    /// Roll back the open transaction. A no-op when nothing is pending.
    ///
    /// # Errors
    /// Returns `ReplicaDbError::QueryError` if `ROLLBACK` fails; the session is then discarded.
    pub async fn rollback(&mut self) -> Result<(), ReplicaDbError> {
        let Some(tx) = self.take_tx() else {
            return Ok(());
        };
        let conn = self.connection()?;
        let outcome = conn.execute("ROLLBACK", ()).await;
        drop(tx);
        if let Err(e) = outcome {
            self.discard_on_release();
            return Err(ReplicaDbError::query("ROLLBACK", e));
        }
        debug!(session = self.session_id, "transaction rolled back");
        Ok(())
    }

    /// Return the session to the pool. Releasing twice is a no-op.
    pub async fn release(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(tx) = self.take_tx() {
            warn!(
                session = self.session_id,
                "handle released with uncommitted writes; rolling back"
            );
            if let Err(e) = rollback_session(&session).await {
                warn!(session = self.session_id, error = %e, "rollback on release failed");
                session.mark_broken();
            }
            drop(tx);
        }
        return_session(session);
        self.shared.give_back(self.session_id);
        debug!(session = self.session_id, "handle released");
    }

    /// Run one statement with positional parameters. See [`executor::execute`].
    ///
    /// # Errors
    /// See [`executor::execute`].
    pub async fn execute(
        &mut self,
        statement: &str,
        params: &[RowValues],
    ) -> Result<QueryResult, ReplicaDbError> {
        executor::execute(self, statement, params).await
    }

    /// Run one statement with named parameters. See [`executor::execute_named`].
    ///
    /// # Errors
    /// See [`executor::execute_named`].
    pub async fn execute_named(
        &mut self,
        statement: &str,
        params: &[(&str, RowValues)],
    ) -> Result<QueryResult, ReplicaDbError> {
        executor::execute_named(self, statement, params).await
    }

    /// # Errors
    /// See [`executor::execute_batch`].
    pub async fn execute_batch(&mut self, script: &str) -> Result<(), ReplicaDbError> {
        executor::execute_batch(self, script).await
    }

    /// # Errors
    /// See [`executor::execute_all`].
    pub async fn execute_all(
        &mut self,
        statements: &[QueryAndParams],
    ) -> Result<Vec<QueryResult>, ReplicaDbError> {
        executor::execute_all(self, statements).await
    }
}

async fn rollback_session(session: &Object<ReplicaManager>) -> Result<(), ReplicaDbError> {
    session
        .connection()?
        .execute("ROLLBACK", ())
        .await
        .map(drop)
        .map_err(|e| ReplicaDbError::query("ROLLBACK", e))
}

/// Broken sessions are detached and closed rather than going back to the idle set.
fn return_session(session: Object<ReplicaManager>) {
    if session.is_broken() {
        debug!(session = session.id(), "closing broken session");
        drop(Object::take(session));
    } else {
        drop(session);
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let Some(tx) = self.take_tx() else {
            return_session(session);
            self.shared.give_back(self.session_id);
            return;
        };

        // Dropped mid-transaction (error path or cancellation): roll back before the
        // writer lock is released.
        let shared = Arc::clone(&self.shared);
        let session_id = self.session_id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let mut session = session;
                if rollback_session(&session).await.is_err() {
                    session.mark_broken();
                }
                drop(tx);
                debug!(session = session_id, "dropped handle rolled back");
                return_session(session);
                shared.give_back(session_id);
            });
        } else {
            // Closing the connection rolls the transaction back.
            drop(Object::take(session));
            drop(tx);
            shared.give_back(session_id);
        }
    }
}
