//! Pooled access to a local libSQL replica that is kept in sync with a remote primary.
//!
//! A [`ReplicaPool`] lends [`ConnectionHandle`]s on a single local database file, a
//! [`ReplicaSyncer`] reconciles that file with the remote, and the [`executor`]
//! functions run parameterized statements on a borrowed handle.
//!
//! ```rust,no_run
//! use replica_middleware::prelude::*;
//!
//! # async fn demo() -> Result<(), ReplicaDbError> {
//! let pool = ReplicaPool::builder("data/local.db")
//!     .remote("libsql://example.turso.io", "token")
//!     .pool_size(5)
//!     .build()
//!     .await?;
//!
//! let mut conn = pool.acquire().await?;
//! let rows = conn
//!     .execute("SELECT id, name FROM users WHERE id = ?1", &[RowValues::Int(1)])
//!     .await?;
//! pool.release(&mut conn).await;
//! # let _ = rows;
//!
//! pool.drain_and_close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod pool;
pub mod prelude;
pub mod results;
pub mod scope;
pub mod sync;
pub mod types;

pub use config::{CommitMode, ReplicaOptions, ReplicaOptionsBuilder, SyncConcurrency};
pub use endpoint::{AuthToken, Endpoint, RemoteEndpoint};
pub use error::ReplicaDbError;
pub use pool::{ConnectionHandle, DrainReport, ReplicaPool, Session};
pub use results::{QueryResult, ResultRow};
pub use scope::with_connection;
pub use sync::{
    EmbeddedReplica, ReplicaSyncer, SyncDelta, SyncPolicy, SyncProtocol, SyncRequest, SyncResult,
    SyncState,
};
pub use types::{QueryAndParams, RowValues};
