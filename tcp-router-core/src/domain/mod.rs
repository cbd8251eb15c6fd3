//! Domain models for listeners, backends and the routing table.

pub mod backend;
pub mod event;
pub mod routing;
