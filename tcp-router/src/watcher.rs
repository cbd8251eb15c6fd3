//! Registry event subscription.
//!
//! The watcher keeps one subscription to the registry event stream open and forwards every
//! event to the updater. It is an explicit state machine:
//!
//! ```text
//! Subscribing --ok--> Streaming --error/end--> Disconnected --retry_at--> Subscribing
//!      |                                            ^
//!      +--------------------failure-----------------+
//! ```
//!
//! Every successful subscription is followed by exactly one full resync, which closes the
//! gap of events missed while disconnected. Sync requests from the syncer or the admin
//! endpoint trigger a resync in any state.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::auth::TokenProvider;
use crate::error::{RegistryError, UpdaterError};
use crate::registry::{EventStream, RoutingRegistry};
use crate::syncer::SyncRequest;
use crate::updater::UpdaterHandle;

/// Where the watcher is in its subscription lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Waiting to retry the subscription.
    Disconnected {
        /// When the next attempt starts.
        retry_at: Instant,
    },
    /// A subscription attempt is in flight.
    Subscribing,
    /// Events are flowing.
    Streaming,
}

/// Delay policy between subscription attempts.
pub trait Backoff: Send + Sync {
    /// Delay before the next attempt.
    fn next_delay(&mut self) -> Duration;

    /// Called after a successful subscription.
    fn reset(&mut self);
}

/// The same delay every time.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    interval: Duration,
}

impl FixedBackoff {
    /// Wait `interval` between every pair of attempts.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Backoff for FixedBackoff {
    fn next_delay(&mut self) -> Duration {
        self.interval
    }

    fn reset(&mut self) {}
}

/// Keeps the registry subscription alive and feeds the updater.
pub struct Watcher {
    registry: Arc<dyn RoutingRegistry>,
    tokens: Arc<dyn TokenProvider>,
    updater: UpdaterHandle,
    sync_requests: mpsc::Receiver<SyncRequest>,
    backoff: Box<dyn Backoff>,
    subscribe_timeout: Duration,
    state: watch::Sender<WatcherState>,
    force_token_refresh: bool,
}

impl Watcher {
    /// Create a watcher that starts in [`WatcherState::Subscribing`].
    ///
    /// `subscribe_timeout` bounds each subscription call; an open stream has no deadline.
    pub fn new(
        registry: Arc<dyn RoutingRegistry>,
        tokens: Arc<dyn TokenProvider>,
        updater: UpdaterHandle,
        sync_requests: mpsc::Receiver<SyncRequest>,
        backoff: Box<dyn Backoff>,
        subscribe_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Subscribing);
        Self {
            registry,
            tokens,
            updater,
            sync_requests,
            backoff,
            subscribe_timeout,
            state,
            force_token_refresh: false,
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Run until shutdown. Fails only when the updater has stopped.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), UpdaterError> {
        let mut stream: Option<EventStream> = None;

        loop {
            let state = *self.state.borrow();
            match state {
                WatcherState::Subscribing => {
                    let attempt = {
                        let pending = subscribe(
                            self.registry.as_ref(),
                            self.tokens.as_ref(),
                            self.force_token_refresh,
                            self.subscribe_timeout,
                        );
                        tokio::pin!(pending);
                        loop {
                            tokio::select! {
                                biased;
                                _ = shutdown.cancelled() => return Ok(()),
                                Some(_) = self.sync_requests.recv() => {
                                    resync(&self.updater).await?;
                                }
                                attempt = &mut pending => break attempt,
                            }
                        }
                    };
                    match attempt {
                        Ok(events) => {
                            self.backoff.reset();
                            self.force_token_refresh = false;
                            stream = Some(events);
                            self.transition(WatcherState::Streaming);
                            tracing::info!("subscribed to registry events");
                            resync(&self.updater).await?;
                        }
                        Err(err) => {
                            let unauthorized = matches!(
                                err,
                                UpdaterError::Subscribe(RegistryError::Unauthorized)
                            );
                            self.force_token_refresh |= unauthorized;
                            tracing::error!(
                                operation = "subscribe",
                                error = %err,
                                "failed to subscribe to registry events"
                            );
                            self.disconnect();
                        }
                    }
                }
                WatcherState::Streaming => {
                    let Some(events) = stream.as_mut() else {
                        self.transition(WatcherState::Subscribing);
                        continue;
                    };
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(()),
                        Some(_) = self.sync_requests.recv() => resync(&self.updater).await?,
                        item = events.next() => match item {
                            Some(Ok(event)) => self.updater.apply(event.into()).await?,
                            Some(Err(err)) if err.is_event_local() => {
                                tracing::warn!(error = %err, "dropping registry event");
                            }
                            Some(Err(err)) => {
                                tracing::error!(error = %err, "registry event stream failed");
                                stream = None;
                                self.disconnect();
                            }
                            None => {
                                tracing::warn!("registry event stream closed");
                                stream = None;
                                self.disconnect();
                            }
                        },
                    }
                }
                WatcherState::Disconnected { retry_at } => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(()),
                        Some(_) = self.sync_requests.recv() => resync(&self.updater).await?,
                        _ = time::sleep_until(retry_at) => {
                            self.transition(WatcherState::Subscribing);
                        }
                    }
                }
            }
        }
    }

    fn disconnect(&mut self) {
        let retry_at = Instant::now() + self.backoff.next_delay();
        self.transition(WatcherState::Disconnected { retry_at });
    }

    fn transition(&self, next: WatcherState) {
        tracing::debug!(state = ?next, "watcher state changed");
        self.state.send_replace(next);
    }
}

async fn subscribe(
    registry: &dyn RoutingRegistry,
    tokens: &dyn TokenProvider,
    force_token_refresh: bool,
    timeout: Duration,
) -> Result<EventStream, UpdaterError> {
    let token = tokens.fetch_token(force_token_refresh).await?;
    time::timeout(timeout, registry.subscribe(&token))
        .await
        .map_err(|_| RegistryError::Timeout(timeout))
        .and_then(|subscribed| subscribed)
        .map_err(UpdaterError::Subscribe)
}

/// Resync failures are retried on the next trigger; only a stopped updater is fatal.
async fn resync(updater: &UpdaterHandle) -> Result<(), UpdaterError> {
    match updater.resync().await {
        Err(UpdaterError::Closed) => Err(UpdaterError::Closed),
        Err(err) => {
            tracing::warn!(error = %err, "resync failed, waiting for next trigger");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

#[cfg(test)]
#[path = "watcher_tests.rs"]
mod watcher_tests;
