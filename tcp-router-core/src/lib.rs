//! TCP router core.
//!
//! This crate contains the routing table model that the TCP router configurer keeps in sync
//! with the routing registry: listener keys, backend endpoints, modification tags and the
//! lock-free snapshot view handed to readers. It performs no I/O.

pub mod domain;

pub use domain::backend::{BackendAddr, BackendEndpoint, ModificationTag};
pub use domain::event::RoutingEvent;
pub use domain::routing::{
    BackendSet, DesiredRoutes, RoutingKey, RoutingSnapshot, RoutingTable, RoutingTableView,
    SharedRoutingTableView,
};
