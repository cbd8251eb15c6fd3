//! Load balancer configuration generation and reload.
//!
//! A configurer projects a [`RoutingSnapshot`] onto the load balancer: it renders the
//! configuration, swaps it in atomically and triggers a reload. The supported load
//! balancers form a closed set selected once at startup through [`LoadBalancerKind`].

mod haproxy;
mod script_runner;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tcp_router_core::RoutingSnapshot;

pub use haproxy::HaProxyConfigurer;
pub use script_runner::{CommandRunner, ScriptRunner};

use crate::error::ConfigureError;
use crate::monitor::ProcessMonitor;

/// Applies a routing snapshot to a load balancer.
#[async_trait]
pub trait RouterConfigurer: Send + Sync {
    /// Render, swap in and reload the configuration for `snapshot`.
    async fn configure(&self, snapshot: &RoutingSnapshot) -> Result<(), ConfigureError>;
}

/// Supported load balancers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LoadBalancerKind {
    /// HAProxy in TCP mode.
    Haproxy,
}

/// Inputs shared by every configurer variant.
pub struct ConfigurerSettings {
    /// Static header prepended to generated listener blocks.
    pub base_config: PathBuf,
    /// Live configuration file read by the load balancer.
    pub config_file: PathBuf,
    /// Liveness of the load balancer process.
    pub monitor: Arc<dyn ProcessMonitor>,
    /// Action that makes the load balancer pick up a new file.
    pub reloader: Arc<dyn ScriptRunner>,
}

/// Build the configurer for `kind`. Fails when the base configuration is unusable.
pub fn new_configurer(
    kind: LoadBalancerKind,
    settings: ConfigurerSettings,
) -> Result<Arc<dyn RouterConfigurer>, ConfigureError> {
    match kind {
        LoadBalancerKind::Haproxy => Ok(Arc::new(HaProxyConfigurer::new(
            &settings.base_config,
            settings.config_file,
            settings.monitor,
            settings.reloader,
        )?)),
    }
}
