//! Periodic full-sync trigger.

use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Asks the watcher to run a full resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest;

/// The shared trigger channel. Capacity one: a pending request absorbs later ones.
pub fn sync_channel() -> (mpsc::Sender<SyncRequest>, mpsc::Receiver<SyncRequest>) {
    mpsc::channel(1)
}

/// Sends a [`SyncRequest`] every interval.
#[derive(Debug)]
pub struct Syncer {
    interval: Duration,
    requests: mpsc::Sender<SyncRequest>,
}

impl Syncer {
    /// Send a request on `requests` every `interval`.
    pub fn new(interval: Duration, requests: mpsc::Sender<SyncRequest>) -> Self {
        Self { interval, requests }
    }

    /// Tick until shutdown. The first request goes out one interval after start.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        // Prevent immediately ticking when spawned
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.requests.try_send(SyncRequest) {
                Ok(()) => tracing::debug!("requested full sync"),
                Err(TrySendError::Full(_)) => tracing::debug!("full sync already pending"),
                Err(TrySendError::Closed(_)) => {
                    tracing::warn!("sync consumer is gone, stopping syncer");
                    break;
                }
            }
        }
    }
}
