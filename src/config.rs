use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;

use crate::endpoint::Endpoint;
use crate::error::ReplicaDbError;
use crate::pool::ReplicaPool;
use crate::sync::{SyncPolicy, SyncProtocol};

pub const DEFAULT_POOL_SIZE: usize = 5;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// When writes become durable in the local file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum)]
pub enum CommitMode {
    /// Every write statement commits on its own.
    #[default]
    Autocommit,
    /// The first write on a handle opens a transaction that stays open until
    /// `commit()`/`rollback()`; releasing the handle without committing rolls back.
    Explicit,
}

/// What a sync request does while another pass is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum)]
pub enum SyncConcurrency {
    /// Wait for the running pass and return its outcome.
    #[default]
    Join,
    /// Wait for the running pass, then run a fresh one.
    Queue,
}

/// Everything the pool needs at construction. Immutable afterwards.
#[derive(Clone)]
pub struct ReplicaOptions {
    pub endpoint: Endpoint,
    pub pool_size: usize,
    pub commit_mode: CommitMode,
    /// Fail initialization if the first sync pass fails (fail-closed).
    /// When false the stale local copy is served instead.
    pub sync_before_serve: bool,
    pub acquire_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// How long SQLite itself waits on a locked file before returning `SQLITE_BUSY`.
    pub busy_timeout: Duration,
    pub sync_concurrency: SyncConcurrency,
    pub sync_policy: SyncPolicy,
    /// Remote protocol override. `None` uses the libsql embedded replica when a remote is set.
    pub sync_protocol: Option<Arc<dyn SyncProtocol>>,
}

impl fmt::Debug for ReplicaOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaOptions")
            .field("endpoint", &self.endpoint)
            .field("pool_size", &self.pool_size)
            .field("commit_mode", &self.commit_mode)
            .field("sync_before_serve", &self.sync_before_serve)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("busy_timeout", &self.busy_timeout)
            .field("sync_concurrency", &self.sync_concurrency)
            .field("sync_policy", &self.sync_policy)
            .field("sync_protocol", &self.sync_protocol.as_ref().map(|p| p.name()))
            .finish()
    }
}

impl ReplicaOptions {
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            pool_size: DEFAULT_POOL_SIZE,
            commit_mode: CommitMode::default(),
            sync_before_serve: true,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            sync_concurrency: SyncConcurrency::default(),
            sync_policy: SyncPolicy::default(),
            sync_protocol: None,
        }
    }

    #[must_use]
    pub fn builder(local_path: impl Into<PathBuf>) -> ReplicaOptionsBuilder {
        ReplicaOptionsBuilder::new(local_path)
    }

    /// # Errors
    /// Returns `ReplicaDbError::ConfigError` for a zero pool size or a zero acquire timeout.
    pub fn validate(&self) -> Result<(), ReplicaDbError> {
        if self.pool_size == 0 {
            return Err(ReplicaDbError::ConfigError(
                "pool_size must be at least 1".into(),
            ));
        }
        if self.acquire_timeout.is_zero() {
            return Err(ReplicaDbError::ConfigError(
                "acquire_timeout must be greater than zero".into(),
            ));
        }
        if let SyncPolicy::Interval(period) = self.sync_policy
            && period.is_zero()
        {
            return Err(ReplicaDbError::ConfigError(
                "sync interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Fluent builder for [`ReplicaOptions`].
#[derive(Debug, Clone)]
pub struct ReplicaOptionsBuilder {
    local_path: PathBuf,
    remote_url: Option<String>,
    remote_token: Option<String>,
    opts: ReplicaOptions,
}

impl ReplicaOptionsBuilder {
    #[must_use]
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        let local_path = local_path.into();
        Self {
            opts: ReplicaOptions::new(Endpoint::local(local_path.clone())),
            local_path,
            remote_url: None,
            remote_token: None,
        }
    }

    /// Mirror a remote database. Both values are required for sync to be enabled.
    #[must_use]
    pub fn remote(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self.remote_token = Some(token.into());
        self
    }

    /// Set the remote from possibly-missing values (e.g. read from the environment).
    /// A URL without a token is rejected by `finish()`.
    #[must_use]
    pub fn remote_parts(mut self, url: Option<String>, token: Option<String>) -> Self {
        self.remote_url = url;
        self.remote_token = token;
        self
    }

    #[must_use]
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.opts.pool_size = pool_size;
        self
    }

    #[must_use]
    pub fn commit_mode(mut self, commit_mode: CommitMode) -> Self {
        self.opts.commit_mode = commit_mode;
        self
    }

    #[must_use]
    pub fn sync_before_serve(mut self, sync_before_serve: bool) -> Self {
        self.opts.sync_before_serve = sync_before_serve;
        self
    }

    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.opts.acquire_timeout = timeout;
        self
    }

    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.opts.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.opts.busy_timeout = timeout;
        self
    }

    #[must_use]
    pub fn sync_concurrency(mut self, concurrency: SyncConcurrency) -> Self {
        self.opts.sync_concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.opts.sync_policy = policy;
        self
    }

    #[must_use]
    pub fn sync_protocol(mut self, protocol: Arc<dyn SyncProtocol>) -> Self {
        self.opts.sync_protocol = Some(protocol);
        self
    }

    /// Validate and produce the options.
    ///
    /// # Errors
    /// Returns `ReplicaDbError::ConfigError` if the endpoint or any limit is invalid.
    pub fn finish(self) -> Result<ReplicaOptions, ReplicaDbError> {
        let mut opts = self.opts;
        opts.endpoint = Endpoint::new(self.local_path, self.remote_url, self.remote_token)?;
        opts.validate()?;
        Ok(opts)
    }

    /// Validate the options and initialize a pool with them.
    ///
    /// # Errors
    /// Returns `ReplicaDbError` if validation, opening the local file, or the initial sync fails.
    pub async fn build(self) -> Result<ReplicaPool, ReplicaDbError> {
        ReplicaPool::initialize(self.finish()?).await
    }
}
