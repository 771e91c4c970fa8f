use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::ReplicaDbError;

const OPEN: u8 = 0;
const DRAINING: u8 = 1;
const CLOSED: u8 = 2;

/// Pool state plus the count of handles currently lent out.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
    in_use: AtomicUsize,
    released: Notify,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(OPEN),
            in_use: AtomicUsize::new(0),
            released: Notify::new(),
        }
    }

    /// New handles are only lent out while the pool is open.
    pub(crate) fn check_acquire(&self) -> Result<(), ReplicaDbError> {
        match self.state.load(Ordering::Acquire) {
            OPEN => Ok(()),
            DRAINING => Err(ReplicaDbError::ConnectionError("pool closing".into())),
            _ => Err(ReplicaDbError::ConnectionError("pool closed".into())),
        }
    }

    /// Handles already lent out keep working through the drain, until force-closed.
    pub(crate) fn check_access(&self) -> Result<(), ReplicaDbError> {
        if self.state.load(Ordering::Acquire) == CLOSED {
            Err(ReplicaDbError::ConnectionError("pool closing".into()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    pub(crate) fn begin_drain(&self) -> bool {
        self.state
            .compare_exchange(OPEN, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn close(&self) {
        self.state.store(CLOSED, Ordering::Release);
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub(crate) fn checked_out(&self) {
        self.in_use.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn checked_in(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.released.notify_waiters();
    }

    /// Wait until no handle is lent out. Returns `false` if `deadline` passed first.
    pub(crate) async fn wait_idle(&self, deadline: Instant) -> bool {
        loop {
            // Registered before the check so a release in between is not missed.
            let released = self.released.notified();
            if self.in_use() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return self.in_use() == 0;
            }
        }
    }
}
