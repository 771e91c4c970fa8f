//! Borrow-run-return for one unit of work.

use futures_util::future::BoxFuture;
use tracing::warn;

use crate::error::ReplicaDbError;
use crate::pool::{ConnectionHandle, ReplicaPool};

/// Acquire a handle, run `f` with it, and give it back on every exit path.
///
/// On `Ok` a pending explicit transaction is committed; on `Err` it is rolled back. If
/// the returned future is dropped mid-flight the handle's `Drop` returns it (rolling back
/// any open transaction first).
///
/// ```rust,no_run
/// # use replica_middleware::prelude::*;
/// # async fn demo(pool: &ReplicaPool) -> Result<(), ReplicaDbError> {
/// let count = with_connection(pool, |conn| {
///     Box::pin(async move {
///         let result = conn.execute("SELECT count(*) FROM users", &[]).await?;
///         Ok::<_, ReplicaDbError>(result.rows.len())
///     })
/// })
/// .await?;
/// # let _ = count;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
/// Acquire failures converted into `E`, whatever `f` returns, or a failed commit.
pub async fn with_connection<T, E, F>(pool: &ReplicaPool, f: F) -> Result<T, E>
where
    F: for<'c> FnOnce(&'c mut ConnectionHandle) -> BoxFuture<'c, Result<T, E>>,
    E: From<ReplicaDbError>,
{
    let mut handle = pool.acquire().await?;
    let outcome = f(&mut handle).await;

    let outcome = match outcome {
        Ok(value) => match handle.commit().await {
            Ok(()) => Ok(value),
            Err(err) => Err(E::from(err)),
        },
        Err(err) => {
            if let Err(rollback) = handle.rollback().await {
                warn!(session = handle.id(), error = %rollback, "rollback after failed scope failed");
            }
            Err(err)
        }
    };

    handle.release().await;
    outcome
}
