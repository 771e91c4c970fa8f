use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Access discipline for the local file.
///
/// Statements hold `apply` shared for their duration; a sync pass holds it exclusively
/// while applying a delta. The lock is fair, so statements arriving while a pass waits
/// queue behind it. Writes additionally hold `writer`, one at a time. Always take `apply`
/// before `writer`.
#[derive(Debug, Clone, Default)]
pub(crate) struct FileGate {
    apply: Arc<RwLock<()>>,
    writer: Arc<Mutex<()>>,
}

/// Held by a write statement or an open explicit transaction.
#[derive(Debug)]
pub(crate) struct WriteGuard {
    _shared: OwnedRwLockReadGuard<()>,
    _writer: OwnedMutexGuard<()>,
}

impl FileGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn read(&self) -> OwnedRwLockReadGuard<()> {
        Arc::clone(&self.apply).read_owned().await
    }

    pub(crate) async fn write(&self) -> WriteGuard {
        let shared = Arc::clone(&self.apply).read_owned().await;
        let writer = Arc::clone(&self.writer).lock_owned().await;
        WriteGuard {
            _shared: shared,
            _writer: writer,
        }
    }

    pub(crate) async fn exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.apply).write_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn exclusive_waits_for_readers() {
        let gate = FileGate::new();
        let reader = gate.read().await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), gate.exclusive()).await;
        assert!(blocked.is_err(), "apply phase must wait for running statements");

        drop(reader);
        let exclusive = tokio::time::timeout(Duration::from_millis(50), gate.exclusive()).await;
        assert!(exclusive.is_ok());
    }

    #[tokio::test]
    async fn writers_are_serialized_but_readers_are_not() {
        let gate = FileGate::new();
        let _first = gate.write().await;

        let second = tokio::time::timeout(Duration::from_millis(50), gate.write()).await;
        assert!(second.is_err(), "only one writer at a time");

        let reader = tokio::time::timeout(Duration::from_millis(50), gate.read()).await;
        assert!(reader.is_ok(), "readers run alongside a writer");
    }
}
