use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ReplicaSyncer;

/// When sync passes run besides explicit `sync()` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Only on explicit request.
    #[default]
    Manual,
    /// Every period, starting one period after the pool is initialized.
    Interval(Duration),
    /// After each committed write. Writes landing while a pass runs collapse into one
    /// follow-up pass.
    AfterWrite,
}

/// Background task driving [`SyncPolicy::Interval`] and [`SyncPolicy::AfterWrite`].
pub(crate) struct SyncScheduler {
    cancel: CancellationToken,
    trigger: Arc<Notify>,
    task: JoinHandle<()>,
    policy: SyncPolicy,
}

impl SyncScheduler {
    /// `None` for [`SyncPolicy::Manual`]. Must be called from within a tokio runtime.
    pub(crate) fn spawn(syncer: Arc<ReplicaSyncer>, policy: SyncPolicy) -> Option<Self> {
        let period = match policy {
            SyncPolicy::Manual => return None,
            SyncPolicy::Interval(period) => Some(period),
            SyncPolicy::AfterWrite => None,
        };

        let cancel = CancellationToken::new();
        let trigger = Arc::new(Notify::new());
        let task = tokio::spawn(run(syncer, period, Arc::clone(&trigger), cancel.clone()));
        debug!(?policy, "sync scheduler started");

        Some(Self {
            cancel,
            trigger,
            task,
            policy,
        })
    }

    /// Notified after committed writes; only present for [`SyncPolicy::AfterWrite`].
    pub(crate) fn write_trigger(&self) -> Option<Arc<Notify>> {
        matches!(self.policy, SyncPolicy::AfterWrite).then(|| Arc::clone(&self.trigger))
    }

    /// Stop the task, giving a running pass until `deadline` to finish.
    pub(crate) async fn stop(mut self, deadline: Instant) {
        self.cancel.cancel();
        if tokio::time::timeout_at(deadline, &mut self.task).await.is_err() {
            warn!("sync scheduler did not stop before the shutdown deadline; aborting it");
            self.task.abort();
        }
    }
}

async fn run(
    syncer: Arc<ReplicaSyncer>,
    period: Option<Duration>,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut ticker = period.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = trigger.notified() => debug!("sync requested by committed write"),
            () = next_tick(&mut ticker) => debug!("periodic sync due"),
        }

        // A pass that has started runs to completion; `stop` bounds the wait.
        if let Err(err) = syncer.sync().await {
            warn!(error = %err, "scheduled sync pass failed");
        }
    }
    debug!("sync scheduler stopped");
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
