//! Expiry sweeper: reclaims sessions whose clients never reported back or
//! whose transport died without a close callback.

use super::store::SessionStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct ExpirySweeper {
    store: Arc<SessionStore>,
    interval: Duration,
    timeout: Duration,
}

impl ExpirySweeper {
    pub fn new(store: Arc<SessionStore>, interval: Duration, timeout: Duration) -> Self {
        Self {
            store,
            interval,
            timeout,
        }
    }

    /// One pass: close and remove every session older than the timeout
    /// as of `now`. Returns the evicted ids.
    pub async fn sweep(&self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        self.store.for_each(
            |session| session.age(now) > self.timeout,
            |session| expired.push(session.id().to_string()),
        );

        let mut evicted = Vec::with_capacity(expired.len());
        for id in expired {
            if self.store.remove(&id).await {
                evicted.push(id);
            }
        }

        if !evicted.is_empty() {
            debug!(
                "🧹 expired sessions removed: {}, active: {}",
                evicted.len(),
                self.store.len()
            );
        }
        evicted
    }

    /// Sweep on a fixed interval until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                interval_secs = self.interval.as_secs(),
                timeout_secs = self.timeout.as_secs(),
                "expiry sweeper started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep(Instant::now()).await;
                    }
                }
            }

            info!("expiry sweeper stopped");
        })
    }
}
