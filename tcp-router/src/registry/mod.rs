//! Routing registry access.
//!
//! The registry is the authority on which backends serve which listener. It offers a full
//! listing and a change stream; both are consumed through [`RoutingRegistry`] so the sync
//! machinery can run against fakes.

mod http;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tcp_router_core::{BackendEndpoint, DesiredRoutes, RoutingEvent, RoutingKey};

pub use http::HttpRegistryClient;

use crate::auth::AccessToken;
use crate::error::RegistryError;

/// One backend registered behind one listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMapping {
    /// Listener served by the backend.
    pub key: RoutingKey,
    /// The registered backend.
    pub endpoint: BackendEndpoint,
}

impl RouteMapping {
    /// Pair a backend with its listener.
    pub fn new(key: RoutingKey, endpoint: BackendEndpoint) -> Self {
        Self { key, endpoint }
    }
}

/// A change published on the registry event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A backend was registered or refreshed.
    Upsert(RouteMapping),
    /// A backend was deregistered.
    Delete(RouteMapping),
    /// Every backend of the listener is gone.
    KeyRemoved(RoutingKey),
}

impl From<RegistryEvent> for RoutingEvent {
    fn from(event: RegistryEvent) -> Self {
        match event {
            RegistryEvent::Upsert(mapping) => RoutingEvent::EndpointAdded {
                key: mapping.key,
                endpoint: mapping.endpoint,
            },
            RegistryEvent::Delete(mapping) => RoutingEvent::EndpointRemoved {
                key: mapping.key,
                endpoint: mapping.endpoint,
            },
            RegistryEvent::KeyRemoved(key) => RoutingEvent::KeyRemoved { key },
        }
    }
}

/// Stream of registry events. Ends or yields a non-local error when the subscription breaks.
pub type EventStream = BoxStream<'static, Result<RegistryEvent, RegistryError>>;

/// Source of truth for routes.
#[async_trait]
pub trait RoutingRegistry: Send + Sync {
    /// The complete current route list.
    async fn fetch_all_routes(&self, token: &AccessToken)
        -> Result<Vec<RouteMapping>, RegistryError>;

    /// Open the change stream.
    async fn subscribe(&self, token: &AccessToken) -> Result<EventStream, RegistryError>;
}

/// Group a flat route listing by listener.
pub fn desired_routes(mappings: Vec<RouteMapping>) -> DesiredRoutes {
    let mut desired = DesiredRoutes::new();
    for mapping in mappings {
        desired.entry(mapping.key).or_default().push(mapping.endpoint);
    }
    desired
}
