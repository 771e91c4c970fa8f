//! Where the local replica lives and which remote it mirrors.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ReplicaDbError;

/// Authentication token for the remote. `Debug` and `Display` never print it.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for handing to the sync protocol.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

impl fmt::Display for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub url: String,
    pub token: AuthToken,
}

/// Local file plus optional remote source of truth.
///
/// Without a remote the pool runs as a plain local database and sync is disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    local_path: PathBuf,
    remote: Option<RemoteEndpoint>,
}

impl Endpoint {
    /// A local-only endpoint.
    pub fn local(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            remote: None,
        }
    }

    /// Validate and build an endpoint.
    ///
    /// # Errors
    /// Returns `ReplicaDbError::ConfigError` if the path is empty, or if exactly one of
    /// `remote_url` / `remote_token` is given (remote sync requires authentication).
    pub fn new(
        local_path: impl Into<PathBuf>,
        remote_url: Option<String>,
        remote_token: Option<String>,
    ) -> Result<Self, ReplicaDbError> {
        let local_path = local_path.into();
        if local_path.as_os_str().is_empty() {
            return Err(ReplicaDbError::ConfigError(
                "local_path must not be empty".into(),
            ));
        }

        let remote = match (remote_url, remote_token) {
            (None, None) => None,
            (Some(url), Some(token)) => {
                if url.trim().is_empty() {
                    return Err(ReplicaDbError::ConfigError(
                        "remote_url must not be blank".into(),
                    ));
                }
                Some(RemoteEndpoint {
                    url,
                    token: AuthToken::new(token),
                })
            }
            (Some(_), None) => {
                return Err(ReplicaDbError::ConfigError(
                    "remote_url is set but remote_token is missing".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(ReplicaDbError::ConfigError(
                    "remote_token is set but remote_url is missing".into(),
                ));
            }
        };

        Ok(Self { local_path, remote })
    }

    #[must_use]
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    #[must_use]
    pub fn remote(&self) -> Option<&RemoteEndpoint> {
        self.remote.as_ref()
    }

    #[must_use]
    pub fn remote_url(&self) -> Option<&str> {
        self.remote.as_ref().map(|r| r.url.as_str())
    }

    #[must_use]
    pub fn sync_enabled(&self) -> bool {
        self.remote.is_some()
    }

    /// Path as the UTF-8 string libsql expects.
    pub(crate) fn local_path_str(&self) -> Result<String, ReplicaDbError> {
        self.local_path
            .to_str()
            .map(str::to_owned)
            .ok_or_else(|| {
                ReplicaDbError::ConfigError(format!(
                    "local_path is not valid UTF-8: {}",
                    self.local_path.display()
                ))
            })
    }
}
