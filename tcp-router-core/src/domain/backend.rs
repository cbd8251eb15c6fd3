//! Backend endpoint models.

use serde::{Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// The identity of a backend instance: the address traffic is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BackendAddr {
    /// Backend host name or IP address.
    pub host: String,
    /// Backend port.
    pub port: u16,
}

impl BackendAddr {
    /// Create a backend address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Version stamp attached to every route by the registry.
///
/// `guid` identifies the epoch that produced the route (a registry instance or storage
/// generation) and `index` increases monotonically within that epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct ModificationTag {
    /// Source epoch.
    pub guid: String,
    /// Monotonic version within the epoch.
    pub index: u32,
}

impl ModificationTag {
    /// Create a modification tag.
    pub fn new(guid: impl Into<String>, index: u32) -> Self {
        Self {
            guid: guid.into(),
            index,
        }
    }

    /// Whether an update stamped with `other` should replace state stamped with `self`.
    ///
    /// A different epoch always wins since epochs carry no order. Within an epoch the
    /// higher index wins, and an equal index resolves to the most recent observation.
    pub fn succeeded_by(&self, other: &ModificationTag) -> bool {
        if self.guid.is_empty() || self.guid != other.guid {
            return true;
        }
        other.index >= self.index
    }
}

/// One backend instance serving a routing key.
///
/// Equality and hashing consider only the address; the tag and TTL are metadata used to
/// arbitrate conflicting updates and to compute freshness.
#[derive(Debug, Clone, Serialize)]
pub struct BackendEndpoint {
    /// Backend host name or IP address.
    pub host: String,
    /// Backend port.
    pub port: u16,
    /// Version of the registration that produced this endpoint.
    pub modification_tag: ModificationTag,
    /// Time to live of the registration, if the registry sent one.
    #[serde(rename = "ttl_secs", serialize_with = "serialize_ttl")]
    pub ttl: Option<Duration>,
}

impl BackendEndpoint {
    /// Create an endpoint with an empty modification tag and no TTL.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            modification_tag: ModificationTag::default(),
            ttl: None,
        }
    }

    /// Set the modification tag.
    pub fn with_tag(mut self, tag: ModificationTag) -> Self {
        self.modification_tag = tag;
        self
    }

    /// Set the time to live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// The address identifying this endpoint within a backend set.
    pub fn addr(&self) -> BackendAddr {
        BackendAddr::new(self.host.clone(), self.port)
    }

    /// The effective TTL, falling back to `default_ttl` when none or zero was sent.
    pub fn effective_ttl(&self, default_ttl: Duration) -> Duration {
        match self.ttl {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => default_ttl,
        }
    }
}

impl PartialEq for BackendEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for BackendEndpoint {}

impl Hash for BackendEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for BackendEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn serialize_ttl<S: Serializer>(ttl: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    ttl.map(|ttl| ttl.as_secs()).serialize(serializer)
}
