//! YAML configuration file for the router configurer.

use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Identity provider settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Token endpoint host.
    #[serde(deserialize_with = "nullable")]
    pub token_endpoint: String,
    /// Token endpoint TLS port; `-1` means TLS is disabled, which is rejected.
    pub port: i32,
    /// Accept any server certificate.
    pub skip_ssl_validation: bool,
    /// OAuth client id.
    #[serde(deserialize_with = "nullable")]
    pub client_name: String,
    /// OAuth client secret.
    #[serde(deserialize_with = "nullable")]
    pub client_secret: String,
    /// Path to a PEM bundle of additional trusted CA certificates.
    #[serde(deserialize_with = "nullable")]
    pub ca_certs: String,
}

/// Routing registry settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RoutingApiConfig {
    /// Registry base URI including the scheme.
    #[serde(deserialize_with = "nullable")]
    pub uri: String,
    /// Registry port.
    pub port: u16,
    /// Skip bearer token authentication.
    pub auth_disabled: bool,
}

impl RoutingApiConfig {
    /// The registry base URL.
    pub fn address(&self) -> String {
        format!("{}:{}", self.uri.trim_end_matches('/'), self.port)
    }
}

/// Contents of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity provider settings.
    pub oauth: OAuthConfig,
    /// Routing registry settings.
    pub routing_api: RoutingApiConfig,
    /// PID file written by the load balancer.
    pub haproxy_pid_file: PathBuf,
    /// Router group whose routes this instance serves.
    #[serde(rename = "router_group", deserialize_with = "nullable")]
    pub router_group_name: String,
}

impl Config {
    /// Load and validate the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents, path)
    }

    /// Parse and validate configuration text. `path` is used for error messages only.
    pub fn from_yaml(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.haproxy_pid_file.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("haproxy_pid_file"));
        }
        if self.router_group_name.is_empty() {
            return Err(ConfigError::MissingField("router_group"));
        }
        if !self.routing_api.auth_disabled && self.oauth.port == -1 {
            return Err(ConfigError::Invalid(
                "the token endpoint must be reached over TLS (oauth.port is -1)".to_string(),
            ));
        }
        Ok(())
    }
}

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
