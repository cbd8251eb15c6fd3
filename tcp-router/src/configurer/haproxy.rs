//! HAProxy configurer.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tcp_router_core::RoutingSnapshot;
use tokio::io::AsyncWriteExt;

use super::{RouterConfigurer, ScriptRunner};
use crate::error::ConfigureError;
use crate::monitor::ProcessMonitor;

/// Writes HAProxy `listen` blocks in TCP mode, one per listener port.
pub struct HaProxyConfigurer {
    base_config: String,
    config_file: PathBuf,
    monitor: Arc<dyn ProcessMonitor>,
    reloader: Arc<dyn ScriptRunner>,
}

impl HaProxyConfigurer {
    /// Read the base configuration and check the live file's directory exists.
    pub fn new(
        base_config_path: &Path,
        config_file: PathBuf,
        monitor: Arc<dyn ProcessMonitor>,
        reloader: Arc<dyn ScriptRunner>,
    ) -> Result<Self, ConfigureError> {
        let base_config =
            std::fs::read_to_string(base_config_path).map_err(|e| ConfigureError::BaseConfig {
                path: base_config_path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let directory = config_file
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if !directory.is_dir() {
            return Err(ConfigureError::Write {
                path: config_file.clone(),
                source: std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("directory {} does not exist", directory.display()),
                ),
            });
        }

        Ok(Self {
            base_config,
            config_file,
            monitor,
            reloader,
        })
    }

    /// Render the full configuration text for `snapshot`.
    pub fn render(&self, snapshot: &RoutingSnapshot) -> String {
        let mut out = String::with_capacity(self.base_config.len() + snapshot.len() * 128);
        out.push_str(&self.base_config);
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }

        for (key, backends) in snapshot.listeners() {
            out.push_str(&format!(
                "\nlisten listen_cfg_{port}\n  mode tcp\n  bind :{port}\n",
                port = key.port
            ));
            for backend in backends {
                out.push_str(&format!(
                    "  server server_{host}_{port} {host}:{port}\n",
                    host = backend.host,
                    port = backend.port
                ));
            }
        }
        out
    }

    fn sibling_path(&self, suffix: &str) -> PathBuf {
        let mut name = self.config_file.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    async fn backup(&self) -> Result<(), ConfigureError> {
        let backup = self.sibling_path(".bak");
        match tokio::fs::copy(&self.config_file, &backup).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ConfigureError::Write {
                path: backup,
                source,
            }),
        }
    }

    /// Write to a staging file in the same directory, then rename over the live file.
    ///
    /// The staging file is removed when any step fails.
    async fn swap_in(&self, contents: &str) -> Result<(), ConfigureError> {
        let staging = self.sibling_path(".tmp");
        let swapped = match write_synced(&staging, contents).await {
            Ok(()) => tokio::fs::rename(&staging, &self.config_file)
                .await
                .map_err(|source| ConfigureError::Write {
                    path: self.config_file.clone(),
                    source,
                }),
            Err(source) => Err(ConfigureError::Write {
                path: staging.clone(),
                source,
            }),
        };

        if swapped.is_err() {
            if let Err(err) = tokio::fs::remove_file(&staging).await {
                if err.kind() != ErrorKind::NotFound {
                    tracing::warn!(
                        path = %staging.display(),
                        error = %err,
                        "failed to remove staging file"
                    );
                }
            }
        }
        swapped
    }
}

async fn write_synced(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(contents.as_bytes()).await?;
    file.sync_all().await
}

#[async_trait]
impl RouterConfigurer for HaProxyConfigurer {
    async fn configure(&self, snapshot: &RoutingSnapshot) -> Result<(), ConfigureError> {
        if !self.monitor.is_running() {
            return Err(ConfigureError::LoadBalancerNotRunning);
        }

        let contents = self.render(snapshot);
        self.backup().await?;
        self.swap_in(&contents).await?;

        self.monitor.stop_watching();
        let reloaded = self.reloader.run().await;
        self.monitor.start_watching();
        reloaded?;

        tracing::info!(
            config = %self.config_file.display(),
            listeners = snapshot.len(),
            backends = snapshot.backend_count(),
            "load balancer reconfigured"
        );
        Ok(())
    }
}

#[cfg(test)]
#[path = "haproxy_tests.rs"]
mod haproxy_tests;
