#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use replica_middleware::prelude::*;
use tempfile::TempDir;

pub const REMOTE_URL: &str = "libsql://primary.example.turso.io";
pub const REMOTE_TOKEN: &str = "test-token";

/// Remote stand-in that replays queued outcomes, then reports "up to date".
#[derive(Default)]
pub struct ScriptedRemote {
    script: Mutex<VecDeque<Result<SyncDelta, String>>>,
    cursors: Mutex<Vec<Option<u64>>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn push_ok(&self, delta: SyncDelta) {
        self.script.lock().unwrap().push_back(Ok(delta));
    }

    pub fn push_err(&self, reason: &str) {
        self.script.lock().unwrap().push_back(Err(reason.to_string()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cursors(&self) -> Vec<Option<u64>> {
        self.cursors.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncProtocol for ScriptedRemote {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn pull(&self, request: SyncRequest<'_>) -> Result<SyncDelta, ReplicaDbError> {
        assert_eq!(request.remote.url, REMOTE_URL);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().unwrap().push(request.cursor);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(delta)) => Ok(delta),
            Some(Err(reason)) => Err(ReplicaDbError::SyncError(reason)),
            None => Ok(SyncDelta::UpToDate),
        }
    }
}

/// Log to the test harness when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scratch directory plus a database path one level below it, so parent creation is exercised.
pub fn scratch() -> (TempDir, PathBuf) {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("data").join("replica.db");
    (dir, path)
}

pub fn local_builder(path: &Path) -> ReplicaOptionsBuilder {
    ReplicaPool::builder(path)
}

pub fn remote_builder(path: &Path, remote: &Arc<ScriptedRemote>) -> ReplicaOptionsBuilder {
    ReplicaPool::builder(path)
        .remote(REMOTE_URL, REMOTE_TOKEN)
        .sync_protocol(Arc::clone(remote) as Arc<dyn SyncProtocol>)
}

pub async fn create_users(pool: &ReplicaPool) -> Result<(), ReplicaDbError> {
    let mut conn = pool.acquire().await?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
         CREATE INDEX IF NOT EXISTS users_name ON users(name);",
    )
    .await?;
    conn.commit().await?;
    pool.release(&mut conn).await;
    Ok(())
}

pub async fn count_users(pool: &ReplicaPool) -> Result<i64, ReplicaDbError> {
    let mut conn = pool.acquire().await?;
    let result = conn.execute("SELECT count(*) AS n FROM users", &[]).await?;
    pool.release(&mut conn).await;
    Ok(*result.rows[0].get("n").and_then(RowValues::as_int).unwrap())
}

/// Main database file plus its WAL, if any.
pub fn file_bytes(path: &Path) -> (Vec<u8>, Option<Vec<u8>>) {
    let main = std::fs::read(path).expect("database file");
    let mut wal = path.as_os_str().to_owned();
    wal.push("-wal");
    (main, std::fs::read(PathBuf::from(wal)).ok())
}

pub async fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}
