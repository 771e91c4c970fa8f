//! Convenient imports for common functionality.

pub use crate::config::{CommitMode, ReplicaOptions, ReplicaOptionsBuilder, SyncConcurrency};
pub use crate::endpoint::Endpoint;
pub use crate::error::ReplicaDbError;
pub use crate::executor::{execute, execute_all, execute_batch, execute_named};
pub use crate::pool::{ConnectionHandle, DrainReport, ReplicaPool};
pub use crate::results::{QueryResult, ResultRow};
pub use crate::scope::with_connection;
pub use crate::sync::{SyncDelta, SyncPolicy, SyncProtocol, SyncRequest, SyncResult, SyncState};
pub use crate::types::{QueryAndParams, RowValues};
