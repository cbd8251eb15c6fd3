//! Error types for the router configurer components.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Loading or validating startup configuration failed.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for the expected schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that was parsed.
        path: PathBuf,
        /// Underlying YAML error.
        source: serde_yaml::Error,
    },

    /// A required field was empty or absent.
    #[error("{0} is required")]
    MissingField(&'static str),

    /// A combination of settings is not allowed.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Fetching a bearer token from the identity provider failed.
#[derive(Error, Debug)]
pub enum TokenError {
    /// The identity provider could not be reached.
    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The identity provider rejected the request.
    #[error("token endpoint returned status {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The identity provider client could not be built.
    #[error("invalid token provider setup: {0}")]
    Setup(String),

    /// All attempts failed.
    #[error("token fetch failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Message of the last failure.
        last: String,
    },
}

/// A routing registry call failed.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The bearer token was rejected.
    #[error("registry rejected the access token")]
    Unauthorized,

    /// The registry could not be reached or answered with a server error.
    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The registry answered with an unexpected status.
    #[error("registry returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The event stream broke.
    #[error("event stream failed: {0}")]
    Stream(String),

    /// A single event could not be decoded.
    #[error("malformed {event} event: {reason}")]
    MalformedEvent {
        /// SSE event name.
        event: String,
        /// Why decoding failed.
        reason: String,
    },

    /// The named router group does not exist.
    #[error("router group {0} not found")]
    RouterGroupNotFound(String),

    /// The call did not finish in time.
    #[error("registry call timed out after {0:?}")]
    Timeout(Duration),
}

impl RegistryError {
    /// Whether the error only affects a single event and the stream may continue.
    pub fn is_event_local(&self) -> bool {
        matches!(self, RegistryError::MalformedEvent { .. })
    }
}

/// Running the reload action failed.
#[derive(Error, Debug)]
pub enum ReloadError {
    /// The reload action could not be started.
    #[error("failed to spawn {path}: {source}")]
    Spawn {
        /// Script path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The reload action exited unsuccessfully.
    #[error("{path} exited with {status}")]
    Failed {
        /// Script path.
        path: PathBuf,
        /// Exit status description.
        status: String,
    },

    /// The reload action did not finish in time.
    #[error("{path} did not finish within {timeout:?}")]
    Timeout {
        /// Script path.
        path: PathBuf,
        /// Bound that was exceeded.
        timeout: Duration,
    },
}

/// Projecting the routing table onto the load balancer failed.
#[derive(Error, Debug)]
pub enum ConfigureError {
    /// The base configuration is missing or unusable.
    #[error("invalid base configuration {path}: {reason}")]
    BaseConfig {
        /// Base configuration path.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// The load balancer process is not alive; nothing was written.
    #[error("load balancer is not running")]
    LoadBalancerNotRunning,

    /// Writing or swapping the configuration file failed.
    #[error("failed to write {path}: {source}")]
    Write {
        /// File being written.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The new configuration was written but the reload failed.
    #[error("reload failed: {0}")]
    Reload(#[from] ReloadError),
}

/// A request to the updater could not be completed.
#[derive(Error, Debug)]
pub enum UpdaterError {
    /// The updater actor has stopped.
    #[error("updater is not running")]
    Closed,

    /// Fetching a token for the registry call failed.
    #[error("fetching token failed: {0}")]
    Token(#[from] TokenError),

    /// The registry call failed.
    #[error("fetching routes failed: {0}")]
    Registry(#[from] RegistryError),

    /// Opening the registry event stream failed.
    #[error("subscribing to route events failed: {0}")]
    Subscribe(RegistryError),
}

/// The load balancer liveness supervisor gave up.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// The supervised process disappeared while it was being watched.
    #[error("load balancer process exited (pid file {0})")]
    ProcessExited(PathBuf),
}
