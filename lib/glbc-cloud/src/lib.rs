//! Cloud API surface for the load-balancer controller
//!
//! This library provides:
//! - The load-balancing resource model (backend services, instance groups,
//!   url maps, proxies, forwarding rules, NEGs, ...)
//! - Capability traits implemented by a cloud client
//! - A structured error that tells a 404 apart from everything else
//! - In-memory fakes of every capability (`fakes` feature)

pub mod error;
pub mod interfaces;
pub mod resources;

#[cfg(feature = "fakes")]
pub mod fakes;

pub use error::{CloudError, Result};
pub use interfaces::{
    BackendServices, Firewalls, HealthChecks, InstanceGroups, LoadBalancers,
    NetworkEndpointGroupCloud, ZoneLister,
};
pub use resources::*;
