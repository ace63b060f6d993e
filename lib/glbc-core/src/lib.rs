//! Load-balancer reconciliation engine
//!
//! This library provides:
//! - Pools for backend services, instance groups, the cluster firewall rule
//!   and per-Ingress L7 load balancers, each with create-or-repair and GC
//! - Background NEG syncers attaching pod endpoints to zonal NEGs
//! - A cluster manager driving one reconciliation pass over all pools
//! - Resource naming, configuration and metrics

pub mod backends;
pub mod cluster_manager;
pub mod config;
pub mod error;
pub mod firewalls;
pub mod healthchecks;
pub mod instances;
pub mod loadbalancers;
pub mod metrics;
pub mod namer;
pub mod neg;
pub mod storage;

pub use backends::{BackendPool, Backends, Protocol, ServicePort};
pub use cluster_manager::{CloudClients, ClusterManager};
pub use config::{ControllerConfig, NegConfig};
pub use error::{Error, Result};
pub use firewalls::{FirewallRules, SingleFirewallPool};
pub use healthchecks::{HealthChecker, HealthChecks};
pub use instances::{Instances, NodePool};
pub use loadbalancers::{GceUrlMap, L7RuntimeInfo, L7s, LoadBalancerPool, L7};
pub use metrics::GlbcMetrics;
pub use namer::Namer;
pub use neg::{EndpointsGetter, NegServicePort, SyncerManager};
