use thiserror::Error;

/// Every failure surfaced by the pool, the syncer and the executor.
///
/// Messages carry statements and placeholder names, never bound parameter values.
#[derive(Debug, Error)]
pub enum ReplicaDbError {
    /// The pool or the local file is unavailable, exhausted, closing or closed.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The remote was unreachable, rejected the credentials, or the delta could not be applied.
    #[error("Sync error: {0}")]
    SyncError(String),

    /// A statement failed to prepare or execute.
    #[error("Query error in `{statement}`: {cause}")]
    QueryError { statement: String, cause: String },

    /// An entity lookup came back empty. Raised by callers, never by this crate.
    #[error("Not found: {0}")]
    NotFoundError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Parameter error: {0}")]
    ParameterError(String),
}

impl ReplicaDbError {
    pub(crate) fn query(statement: &str, cause: impl std::fmt::Display) -> Self {
        ReplicaDbError::QueryError {
            statement: statement.to_string(),
            cause: cause.to_string(),
        }
    }

    /// Message suitable for a `SyncError`, without nesting prefixes.
    pub(crate) fn sync_reason(&self) -> String {
        match self {
            ReplicaDbError::SyncError(reason) => reason.clone(),
            other => other.to_string(),
        }
    }

    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ReplicaDbError::ConnectionError(_))
    }

    #[must_use]
    pub fn is_sync_error(&self) -> bool {
        matches!(self, ReplicaDbError::SyncError(_))
    }
}

impl From<deadpool::managed::BuildError> for ReplicaDbError {
    fn from(err: deadpool::managed::BuildError) -> Self {
        ReplicaDbError::ConfigError(format!("Failed to build session pool: {err}"))
    }
}
