//! TCP Router Configurer
//!
//! Keeps the listener configuration of a TCP load balancer in sync with the routing
//! registry: subscribes to route changes, periodically resyncs the full route list, prunes
//! routes whose registrations expired, and rewrites and reloads the load balancer
//! configuration whenever the set of backends behind a listener changes.

#![deny(missing_docs)]

mod auth;
mod cli;
mod config;
mod configurer;
mod error;
mod monitor;
mod pruner;
mod registry;
mod server;
mod syncer;
mod tls;
mod updater;
mod watcher;

#[cfg(test)]
mod test_support;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tcp_router_core::RoutingTable;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::auth::{NoOpTokenProvider, OAuthSettings, OAuthTokenFetcher, TokenProvider};
use crate::cli::Cli;
use crate::config::Config;
use crate::configurer::{CommandRunner, ConfigurerSettings, RouterConfigurer};
use crate::error::{RegistryError, TokenError};
use crate::monitor::PidFileMonitor;
use crate::registry::{HttpRegistryClient, RoutingRegistry};
use crate::server::AdminState;
use crate::syncer::Syncer;
use crate::updater::Updater;
use crate::watcher::{FixedBackoff, Watcher};

const EXIT_STARTUP_FAILURE: u8 = 1;
const EXIT_COMPONENT_FAILURE: u8 = 2;

/// Everything built during startup that the long-running tasks share.
struct Services {
    monitor: Arc<PidFileMonitor>,
    configurer: Arc<dyn RouterConfigurer>,
    registry: Arc<dyn RoutingRegistry>,
    tokens: Arc<dyn TokenProvider>,
    admin: Option<TcpListener>,
}

type TaskResult = (&'static str, anyhow::Result<()>);

/// The entrypoint of the router configurer.
///
/// Exits with 1 when startup fails and with 2 when a supervised component stops on its own.
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    tracing::info!("starting");

    let services = match startup(&cli).await {
        Ok(services) => services,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "startup failed");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    run(&cli, services).await
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn startup(cli: &Cli) -> anyhow::Result<Services> {
    cli.validate()?;
    let config = Config::load(&cli.config)?;

    let monitor = Arc::new(PidFileMonitor::new(&config.haproxy_pid_file));
    tracing::debug!(pid_file = %monitor.pid_file().display(), "monitoring load balancer");
    let configurer = configurer::new_configurer(
        cli.load_balancer,
        ConfigurerSettings {
            base_config: cli.base_config.clone(),
            config_file: cli.lb_config.clone(),
            monitor: monitor.clone(),
            reloader: Arc::new(CommandRunner::new(&cli.reloader, cli.reload_timeout())),
        },
    )?;

    let tokens = token_provider(&config, cli)?;
    // Check identity provider connectivity
    let token = tokens
        .fetch_token(true)
        .await
        .context("connecting to the identity provider")?;

    let address = config.routing_api.address();
    tracing::debug!(api_location = %address, "creating routing registry client");
    let registry = HttpRegistryClient::new(address, cli.registry_timeout())?;

    let router_group_guid = tokio::time::timeout(
        cli.registry_timeout(),
        registry.router_group_guid(&config.router_group_name, &token),
    )
    .await
    .map_err(|_| RegistryError::Timeout(cli.registry_timeout()))?
    .context("fetching router group")?;
    tracing::info!(
        router_group = %config.router_group_name,
        router_group_guid = %router_group_guid,
        "retrieved router group"
    );

    let admin = match cli.admin_address {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding admin endpoint to {addr}"))?,
        ),
        None => None,
    };

    Ok(Services {
        monitor,
        configurer,
        registry: Arc::new(registry.with_router_group(router_group_guid)),
        tokens,
        admin,
    })
}

fn token_provider(config: &Config, cli: &Cli) -> Result<Arc<dyn TokenProvider>, TokenError> {
    if config.routing_api.auth_disabled {
        tracing::debug!("creating no-op token provider");
        return Ok(Arc::new(NoOpTokenProvider));
    }

    tracing::debug!(token_endpoint = %config.oauth.token_endpoint, "creating token fetcher");
    let oauth = &config.oauth;
    let settings = OAuthSettings {
        base_url: format!("https://{}:{}", oauth.token_endpoint, oauth.port),
        client_name: oauth.client_name.clone(),
        client_secret: oauth.client_secret.clone(),
        max_retries: cli.token_fetch_max_retries,
        retry_interval: cli.token_fetch_retry_interval(),
        expiration_buffer: cli.token_fetch_expiration_buffer(),
        ca_certs: (!oauth.ca_certs.is_empty()).then(|| PathBuf::from(&oauth.ca_certs)),
        skip_ssl_validation: oauth.skip_ssl_validation,
        request_timeout: cli.registry_timeout(),
    };
    Ok(Arc::new(OAuthTokenFetcher::new(settings)?))
}

async fn run(cli: &Cli, services: Services) -> ExitCode {
    let shutdown = CancellationToken::new();
    let (updater, handle) = Updater::new(
        RoutingTable::new(cli.default_route_expiry()),
        services.configurer,
        services.registry.clone(),
        services.tokens.clone(),
        cli.registry_timeout(),
    );
    let (sync_tx, sync_rx) = syncer::sync_channel();
    let watcher = Watcher::new(
        services.registry,
        services.tokens,
        handle.clone(),
        sync_rx,
        Box::new(FixedBackoff::new(cli.subscription_retry_interval())),
        cli.registry_timeout(),
    );

    let mut tasks: JoinSet<TaskResult> = JoinSet::new();

    let token = shutdown.clone();
    tasks.spawn(async move {
        updater.run(token).await;
        ("updater", anyhow::Ok(()))
    });

    let token = shutdown.clone();
    tasks.spawn(async move { ("watcher", watcher.run(token).await.map_err(anyhow::Error::from)) });

    let token = shutdown.clone();
    let syncer = Syncer::new(cli.sync_interval(), sync_tx.clone());
    tasks.spawn(async move {
        syncer.run(token).await;
        ("syncer", anyhow::Ok(()))
    });

    let token = shutdown.clone();
    let prune = pruner::run_route_pruner(handle.clone(), cli.stale_route_check_interval(), token);
    tasks.spawn(async move { ("route-pruner", prune.await.map_err(anyhow::Error::from)) });

    let token = shutdown.clone();
    let monitor = services.monitor.run(cli.monitor_interval(), token);
    tasks.spawn(async move { ("monitor", monitor.await.map_err(anyhow::Error::from)) });

    if let Some(listener) = services.admin {
        let token = shutdown.clone();
        let state = AdminState::new(handle.clone(), sync_tx);
        tasks.spawn(async move {
            server::start_admin_server(listener, state, token).await;
            ("admin", anyhow::Ok(()))
        });
    }

    tracing::info!("started");

    let mut exit = ExitCode::SUCCESS;
    tokio::select! {
        _ = shutdown_signal() => tracing::info!("received shutdown signal"),
        Some(joined) = tasks.join_next() => {
            match joined {
                Ok((name, Ok(()))) => {
                    tracing::error!(component = name, "component stopped unexpectedly");
                }
                Ok((name, Err(err))) => {
                    tracing::error!(
                        component = name,
                        error = %format!("{err:#}"),
                        "component failed"
                    );
                }
                Err(err) => tracing::error!(error = %err, "component panicked"),
            }
            exit = ExitCode::from(EXIT_COMPONENT_FAILURE);
        }
    }

    shutdown.cancel();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => tracing::debug!(component = name, "component stopped"),
            Ok((name, Err(err))) => {
                tracing::debug!(component = name, error = %err, "component stopped with error");
            }
            Err(err) => tracing::error!(error = %err, "component panicked during shutdown"),
        }
    }

    tracing::info!("exited");
    exit
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
