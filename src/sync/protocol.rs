use std::fmt;

use async_trait::async_trait;
use libsql::{Builder, Database};

use crate::endpoint::{Endpoint, RemoteEndpoint};
use crate::error::ReplicaDbError;
use crate::types::QueryAndParams;

/// What a sync pass asks the remote for.
#[derive(Debug, Clone, Copy)]
pub struct SyncRequest<'a> {
    /// Position reached by the last successful pass; `None` before the first one.
    pub cursor: Option<u64>,
    pub remote: &'a RemoteEndpoint,
}

/// Changes fetched from the remote, applied to the local file while the file gate is held
/// exclusively.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncDelta {
    /// The remote has nothing past the cursor.
    UpToDate,
    /// The embedded-replica engine pulls WAL frames from the primary itself
    /// (`Database::sync`); the frames are only transferred once the gate is held.
    Replicate,
    /// A statement log replayed in one transaction. Either all statements apply or none do.
    Statements {
        batch: Vec<QueryAndParams>,
        /// Cursor to record once the batch has been committed.
        frame_no: Option<u64>,
    },
}

/// The remote side of a sync pass.
///
/// `pull` must not touch the local file: a failed pull leaves the replica exactly as it was.
#[async_trait]
pub trait SyncProtocol: Send + Sync {
    /// Label used in logs and `Debug` output.
    fn name(&self) -> &'static str;

    /// Open (creating if absent) the local database file for this endpoint.
    async fn open(&self, endpoint: &Endpoint) -> Result<Database, ReplicaDbError> {
        open_local(endpoint).await
    }

    /// Fetch everything the remote has past `request.cursor`.
    async fn pull(&self, request: SyncRequest<'_>) -> Result<SyncDelta, ReplicaDbError>;
}

impl fmt::Debug for dyn SyncProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SyncProtocol").field(&self.name()).finish()
    }
}

/// Open the endpoint's local file as a plain libsql database.
///
/// # Errors
/// Returns `ReplicaDbError::ConnectionError` if the file cannot be opened or created.
pub async fn open_local(endpoint: &Endpoint) -> Result<Database, ReplicaDbError> {
    let path = endpoint.local_path_str()?;
    Builder::new_local(path.as_str())
        .build()
        .await
        .map_err(|e| {
            ReplicaDbError::ConnectionError(format!(
                "Failed to open local database {path}: {e}"
            ))
        })
}

/// libsql embedded replica: the local file is a replica of a Turso/libsql primary and
/// sync pulls the primary's WAL frames past the replica's own frame number.
#[derive(Debug, Clone)]
pub struct EmbeddedReplica {
    read_your_writes: bool,
}

impl Default for EmbeddedReplica {
    fn default() -> Self {
        Self {
            read_your_writes: true,
        }
    }
}

impl EmbeddedReplica {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether writes forwarded to the primary are visible locally before the next sync.
    #[must_use]
    pub fn read_your_writes(mut self, read_your_writes: bool) -> Self {
        self.read_your_writes = read_your_writes;
        self
    }
}

#[async_trait]
impl SyncProtocol for EmbeddedReplica {
    fn name(&self) -> &'static str {
        "embedded-replica"
    }

    #[cfg(feature = "replication")]
    async fn open(&self, endpoint: &Endpoint) -> Result<Database, ReplicaDbError> {
        let remote = endpoint.remote().ok_or_else(|| {
            ReplicaDbError::ConfigError("embedded replica requires a remote endpoint".into())
        })?;
        let path = endpoint.local_path_str()?;
        Builder::new_remote_replica(
            path.as_str(),
            remote.url.clone(),
            remote.token.expose().to_string(),
        )
        .read_your_writes(self.read_your_writes)
        .build()
        .await
        .map_err(|e| {
            ReplicaDbError::ConnectionError(format!(
                "Failed to open embedded replica {path} of {}: {e}",
                remote.url
            ))
        })
    }

    #[cfg(not(feature = "replication"))]
    async fn open(&self, _endpoint: &Endpoint) -> Result<Database, ReplicaDbError> {
        Err(ReplicaDbError::ConfigError(
            "embedded replica support requires the `replication` feature".into(),
        ))
    }

    async fn pull(&self, _request: SyncRequest<'_>) -> Result<SyncDelta, ReplicaDbError> {
        Ok(SyncDelta::Replicate)
    }
}
