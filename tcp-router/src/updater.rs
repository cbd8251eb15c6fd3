//! Single owner of the routing table.
//!
//! The [`Updater`] runs as an actor: every mutation arrives as a command on one channel, so
//! table changes and the configure calls they trigger are totally ordered. Readers use the
//! published [`RoutingTableView`](tcp_router_core::RoutingTableView) instead of the table.

use std::sync::Arc;
use std::time::Duration;

use tcp_router_core::{
    RoutingEvent, RoutingSnapshot, RoutingTable, RoutingTableView, SharedRoutingTableView,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::auth::{AccessToken, TokenProvider};
use crate::configurer::RouterConfigurer;
use crate::error::{RegistryError, UpdaterError};
use crate::registry::{desired_routes, RouteMapping, RoutingRegistry};

const COMMAND_BUFFER: usize = 64;

enum Command {
    Apply {
        event: RoutingEvent,
        ack: oneshot::Sender<()>,
    },
    Resync {
        ack: oneshot::Sender<Result<(), UpdaterError>>,
    },
    Prune {
        ack: oneshot::Sender<()>,
    },
}

/// Cloneable front end of the updater actor.
#[derive(Clone)]
pub struct UpdaterHandle {
    commands: mpsc::Sender<Command>,
    view: SharedRoutingTableView,
}

impl UpdaterHandle {
    /// Apply one registry event and reconfigure if membership changed.
    pub async fn apply(&self, event: RoutingEvent) -> Result<(), UpdaterError> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Apply { event, ack }).await?;
        done.await.map_err(|_| UpdaterError::Closed)
    }

    /// Replace the table with the registry's full route list.
    pub async fn resync(&self) -> Result<(), UpdaterError> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Resync { ack }).await?;
        done.await.map_err(|_| UpdaterError::Closed)?
    }

    /// Drop expired endpoints.
    pub async fn prune_stale_routes(&self) -> Result<(), UpdaterError> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Prune { ack }).await?;
        done.await.map_err(|_| UpdaterError::Closed)
    }

    /// The most recently published table contents.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.view.snapshot()
    }

    async fn send(&self, command: Command) -> Result<(), UpdaterError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| UpdaterError::Closed)
    }
}

/// The actor owning the routing table.
pub struct Updater {
    table: RoutingTable,
    configurer: Arc<dyn RouterConfigurer>,
    registry: Arc<dyn RoutingRegistry>,
    tokens: Arc<dyn TokenProvider>,
    view: SharedRoutingTableView,
    commands: mpsc::Receiver<Command>,
    registry_timeout: Duration,
    /// Set when the last configure failed; the next resync or prune reconfigures.
    load_balancer_stale: bool,
    /// Cleared by the first successful resync, which always reconfigures.
    awaiting_first_sync: bool,
}

impl Updater {
    /// Create the actor around `table` and the handle used to reach it.
    ///
    /// Nothing is processed until [`Updater::run`] is awaited.
    pub fn new(
        table: RoutingTable,
        configurer: Arc<dyn RouterConfigurer>,
        registry: Arc<dyn RoutingRegistry>,
        tokens: Arc<dyn TokenProvider>,
        registry_timeout: Duration,
    ) -> (Self, UpdaterHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let view = Arc::new(RoutingTableView::new());
        view.publish(table.snapshot());

        let updater = Self {
            table,
            configurer,
            registry,
            tokens,
            view: view.clone(),
            commands: rx,
            registry_timeout,
            load_balancer_stale: false,
            awaiting_first_sync: true,
        };
        let handle = UpdaterHandle { commands: tx, view };
        (updater, handle)
    }

    /// Process commands until shutdown or until every handle is dropped.
    ///
    /// A command already taken off the channel runs to completion, including its reload.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let command = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                Command::Apply { event, ack } => {
                    self.apply(event).await;
                    let _ = ack.send(());
                }
                Command::Resync { ack } => {
                    let _ = ack.send(self.resync().await);
                }
                Command::Prune { ack } => {
                    self.prune().await;
                    let _ = ack.send(());
                }
            }
        }
        tracing::info!("updater stopped");
    }

    async fn apply(&mut self, event: RoutingEvent) {
        let key = event.key();
        let action = event.action();
        let changed = self.table.apply(event, now());
        tracing::debug!(port = key.port, action, changed, "applied routing event");
        self.sync_load_balancer(changed).await;
    }

    async fn resync(&mut self) -> Result<(), UpdaterError> {
        let routes = self.fetch_routes().await.inspect_err(|err| {
            tracing::error!(operation = "resync", error = %err, "failed to fetch routes");
        })?;

        let changed = self.table.replace_all(desired_routes(routes), now());
        tracing::info!(
            listeners = self.table.len(),
            changed = changed.len(),
            "routing table synced"
        );
        // The live file may still hold listeners from a previous run.
        let first_sync = std::mem::replace(&mut self.awaiting_first_sync, false);
        self.sync_load_balancer(!changed.is_empty() || self.load_balancer_stale || first_sync)
            .await;
        Ok(())
    }

    async fn prune(&mut self) {
        let changed = self.table.expire_stale(now());
        if !changed.is_empty() {
            tracing::info!(
                ports = ?changed.iter().map(|key| key.port).collect::<Vec<_>>(),
                "pruned stale routes"
            );
        }
        self.sync_load_balancer(!changed.is_empty() || self.load_balancer_stale)
            .await;
    }

    /// Publish the table and, when `reconfigure` is set, push it to the load balancer.
    async fn sync_load_balancer(&mut self, reconfigure: bool) {
        let snapshot = self.table.snapshot();
        self.view.publish(snapshot.clone());
        if !reconfigure {
            return;
        }

        match self.configurer.configure(&snapshot).await {
            Ok(()) => self.load_balancer_stale = false,
            Err(err) => {
                self.load_balancer_stale = true;
                tracing::error!(
                    operation = "configure",
                    error = %err,
                    "failed to configure load balancer"
                );
            }
        }
    }

    async fn fetch_routes(&self) -> Result<Vec<RouteMapping>, UpdaterError> {
        let token = self.tokens.fetch_token(false).await?;
        match self.fetch_with_timeout(&token).await {
            Err(RegistryError::Unauthorized) => {
                tracing::warn!("registry rejected access token, refreshing");
                let token = self.tokens.fetch_token(true).await?;
                Ok(self.fetch_with_timeout(&token).await?)
            }
            other => Ok(other?),
        }
    }

    async fn fetch_with_timeout(
        &self,
        token: &AccessToken,
    ) -> Result<Vec<RouteMapping>, RegistryError> {
        time::timeout(self.registry_timeout, self.registry.fetch_all_routes(token))
            .await
            .map_err(|_| RegistryError::Timeout(self.registry_timeout))?
    }
}

/// Current time on the tokio clock, so paused-time tests control route expiry.
fn now() -> std::time::Instant {
    time::Instant::now().into_std()
}

#[cfg(test)]
#[path = "updater_tests.rs"]
mod updater_tests;
