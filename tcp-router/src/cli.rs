//! Command-line flags.
//!
//! Every interval flag is given in whole seconds and exposed as a [`Duration`] accessor.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::configurer::LoadBalancerKind;
use crate::error::ConfigError;

/// Route TTLs travel as 16-bit second counts.
const MAX_ROUTE_EXPIRY_SECS: u64 = 65535;

/// Flags of the `tcp-router` binary.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tcp-router",
    about = "Keeps a TCP load balancer configuration in sync with the routing registry",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Cli {
    #[arg(
        long,
        env = "TCP_ROUTER_CONFIG",
        default_value = "/var/vcap/jobs/tcp_router/config/tcp_router.yml",
        help = "Path to the YAML configuration file"
    )]
    pub config: PathBuf,

    #[arg(long, value_enum, default_value_t = LoadBalancerKind::Haproxy, help = "Load balancer to configure")]
    pub load_balancer: LoadBalancerKind,

    #[arg(long, help = "Base configuration prepended to the generated listener blocks")]
    pub base_config: PathBuf,

    #[arg(long, help = "Live load balancer configuration file to generate")]
    pub lb_config: PathBuf,

    #[arg(
        long,
        default_value = "/var/vcap/jobs/tcp_router/bin/haproxy_reloader",
        help = "Executable that reloads the load balancer"
    )]
    pub reloader: PathBuf,

    #[arg(long, default_value_t = 5, help = "Seconds between event subscription attempts")]
    pub subscription_retry_interval: u64,

    #[arg(long, default_value_t = 60, help = "Seconds between full syncs")]
    pub sync_interval: u64,

    #[arg(long, default_value_t = 30, help = "Seconds between stale route checks")]
    pub stale_route_check_interval: u64,

    #[arg(long, default_value_t = 120, help = "TTL in seconds for routes registered without one")]
    pub default_route_expiry: u64,

    #[arg(long, default_value_t = 3, help = "Retries per token fetch")]
    pub token_fetch_max_retries: u32,

    #[arg(long, default_value_t = 5, help = "Seconds between token fetch retries")]
    pub token_fetch_retry_interval: u64,

    #[arg(
        long,
        default_value_t = 30,
        help = "Seconds before expiry at which a cached token is considered expired"
    )]
    pub token_fetch_expiration_buffer: u64,

    #[arg(long, default_value_t = 30, help = "Timeout in seconds for registry calls")]
    pub registry_timeout: u64,

    #[arg(long, default_value_t = 60, help = "Timeout in seconds for the reload action")]
    pub reload_timeout: u64,

    #[arg(long, default_value_t = 5, help = "Seconds between load balancer liveness checks")]
    pub monitor_interval: u64,

    #[arg(long, help = "Address for the admin endpoint (disabled when unset)")]
    pub admin_address: Option<SocketAddr>,

    #[arg(short, long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Reject interval combinations that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_route_expiry > MAX_ROUTE_EXPIRY_SECS {
            return Err(ConfigError::Invalid(format!(
                "route expiry cannot be greater than {MAX_ROUTE_EXPIRY_SECS}"
            )));
        }
        if self.stale_route_check_interval > self.default_route_expiry {
            return Err(ConfigError::Invalid(
                "stale route check interval cannot be greater than route expiry".to_string(),
            ));
        }
        let intervals = [
            ("subscription-retry-interval", self.subscription_retry_interval),
            ("sync-interval", self.sync_interval),
            ("stale-route-check-interval", self.stale_route_check_interval),
            ("default-route-expiry", self.default_route_expiry),
            ("registry-timeout", self.registry_timeout),
            ("reload-timeout", self.reload_timeout),
            ("monitor-interval", self.monitor_interval),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }
        Ok(())
    }

    /// Delay between event subscription attempts.
    pub fn subscription_retry_interval(&self) -> Duration {
        Duration::from_secs(self.subscription_retry_interval)
    }

    /// Period of the full-sync trigger.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval)
    }

    /// Period of the stale route pruner.
    pub fn stale_route_check_interval(&self) -> Duration {
        Duration::from_secs(self.stale_route_check_interval)
    }

    /// TTL applied to routes registered without one.
    pub fn default_route_expiry(&self) -> Duration {
        Duration::from_secs(self.default_route_expiry)
    }

    /// Pause between failed token fetches.
    pub fn token_fetch_retry_interval(&self) -> Duration {
        Duration::from_secs(self.token_fetch_retry_interval)
    }

    /// How early a cached token is treated as expired.
    pub fn token_fetch_expiration_buffer(&self) -> Duration {
        Duration::from_secs(self.token_fetch_expiration_buffer)
    }

    /// Bound on each registry and identity provider call.
    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout)
    }

    /// Bound on the reload action.
    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout)
    }

    /// Period of the load balancer liveness check.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval)
    }
}
