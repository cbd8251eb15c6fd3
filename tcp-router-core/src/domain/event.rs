//! Routing table mutations delivered by the registry event stream.

use crate::domain::backend::BackendEndpoint;
use crate::domain::routing::RoutingKey;

/// A single change to the desired routing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingEvent {
    /// An endpoint was registered (or re-registered) behind a listener.
    EndpointAdded {
        /// Listener the endpoint serves.
        key: RoutingKey,
        /// The registered endpoint.
        endpoint: BackendEndpoint,
    },
    /// An endpoint was deregistered from a listener.
    EndpointRemoved {
        /// Listener the endpoint served.
        key: RoutingKey,
        /// The deregistered endpoint.
        endpoint: BackendEndpoint,
    },
    /// The listener was deprovisioned.
    KeyRemoved {
        /// The deprovisioned listener.
        key: RoutingKey,
    },
}

impl RoutingEvent {
    /// The listener this event touches.
    pub fn key(&self) -> RoutingKey {
        match self {
            RoutingEvent::EndpointAdded { key, .. }
            | RoutingEvent::EndpointRemoved { key, .. }
            | RoutingEvent::KeyRemoved { key } => *key,
        }
    }

    /// Short name used in log fields.
    pub fn action(&self) -> &'static str {
        match self {
            RoutingEvent::EndpointAdded { .. } => "endpoint-added",
            RoutingEvent::EndpointRemoved { .. } => "endpoint-removed",
            RoutingEvent::KeyRemoved { .. } => "key-removed",
        }
    }
}
