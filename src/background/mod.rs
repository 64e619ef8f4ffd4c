//! Background tasks owned by a running webapp.
//!
//! Currently a single one: the [`SessionWatchdog`], which periodically evicts
//! sessions that have been idle past their interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::session::SessionStore;

/// Default pause between two sweeps.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_millis(5000);

/// Longest pause honoured between sweeps; larger intervals are clamped.
const MAX_WATCHDOG_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Handle to the running expiry task.
///
/// Dropping the handle without calling [`stop`](Self::stop) signals the task to
/// exit but does not wait for it.
#[derive(Debug)]
pub struct SessionWatchdog {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SessionWatchdog {
    /// Spawns the sweep loop on the current tokio runtime.
    ///
    /// The first sweep happens one `interval` after spawning.
    pub fn spawn(store: Arc<dyn SessionStore>, interval: Duration) -> Self {
        let (tx, mut rx) = oneshot::channel();
        let period = interval.clamp(Duration::from_millis(1), MAX_WATCHDOG_INTERVAL);

        let task = tokio::spawn(async move {
            let interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
            info!(interval_ms, "session watchdog started");
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut rx => break,
                    _ = ticker.tick() => {
                        let removed = store.destroy_inactive_sessions();
                        if removed > 0 {
                            debug!(removed, remaining = store.session_count(), "swept inactive sessions");
                        }
                    }
                }
            }
            info!("session watchdog stopped");
        });

        Self {
            shutdown: Some(tx),
            task,
        }
    }

    /// Signals the loop to exit and waits until it has. A sweep already in
    /// progress finishes first; none start afterwards.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "session watchdog task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionStore;

    #[tokio::test]
    async fn sweeps_expired_sessions_periodically() {
        let store = Arc::new(InMemorySessionStore::new());
        let session = store.create_session();
        session.set_max_inactive_interval(0);
        let keeper = store.create_session();
        keeper.set_max_inactive_interval(-1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let watchdog = SessionWatchdog::spawn(store.clone(), Duration::from_millis(25));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(store.find_session(session.id()).is_none());
        assert!(store.find_session(keeper.id()).is_some());
        watchdog.stop().await;
    }

    #[tokio::test]
    async fn huge_interval_is_clamped() {
        let store = Arc::new(InMemorySessionStore::new());
        let watchdog = SessionWatchdog::spawn(store, Duration::MAX);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!watchdog.is_finished());
        watchdog.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_termination() {
        let store = Arc::new(InMemorySessionStore::new());
        let watchdog = SessionWatchdog::spawn(store.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        watchdog.stop().await;

        // No sweeps after stop.
        let session = store.create_session();
        session.set_max_inactive_interval(0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.find_session(session.id()).is_some());
    }
}
