//! In-memory fakes of every cloud capability.
//!
//! Each fake records the mutating calls it receives (`calls`) and can be told
//! to fail a named operation (`faults`), so tests can assert on exactly which
//! cloud writes a reconciliation pass issued.

mod backend_services;
mod firewalls;
mod instance_groups;
mod load_balancers;
mod neg;

pub use backend_services::{FakeBackendServices, FakeHealthChecks};
pub use firewalls::FakeFirewalls;
pub use instance_groups::FakeInstanceGroups;
pub use load_balancers::FakeLoadBalancers;
pub use neg::FakeNetworkEndpointGroupCloud;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{CloudError, Result};
use crate::interfaces::ZoneLister;

/// Prefix of every link handed out by the fakes.
pub const PROJECT_LINK: &str = "https://www.googleapis.com/compute/v1/projects/test-project";

pub fn global_link(collection: &str, name: &str) -> String {
    format!("{}/global/{}/{}", PROJECT_LINK, collection, name)
}

pub fn zonal_link(zone: &str, collection: &str, name: &str) -> String {
    format!("{}/zones/{}/{}/{}", PROJECT_LINK, zone, collection, name)
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered log of mutating calls, recorded as `operation:resource`.
#[derive(Default, Debug)]
pub struct CallLog {
    calls: Mutex<Vec<String>>,
}

impl CallLog {
    pub fn record(&self, operation: &str, resource: &str) {
        lock(&self.calls).push(format!("{}:{}", operation, resource));
    }

    pub fn all(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Calls for one operation, in order, as resource names.
    pub fn of(&self, operation: &str) -> Vec<String> {
        let prefix = format!("{}:", operation);
        lock(&self.calls)
            .iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.of(operation).len()
    }

    pub fn clear(&self) {
        lock(&self.calls).clear();
    }
}

/// Errors to return from named operations until cleared.
#[derive(Default, Debug)]
pub struct Faults {
    errors: Mutex<HashMap<String, CloudError>>,
}

impl Faults {
    pub fn set(&self, operation: &str, err: CloudError) {
        lock(&self.errors).insert(operation.to_string(), err);
    }

    pub fn clear(&self, operation: &str) {
        lock(&self.errors).remove(operation);
    }

    pub(crate) fn check(&self, operation: &str) -> Result<()> {
        match lock(&self.errors).get(operation) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Zone lister over a fixed zone list. Nodes without an explicit zone land
/// in the first zone.
#[derive(Debug)]
pub struct FakeZoneLister {
    zones: Vec<String>,
    nodes: Mutex<HashMap<String, String>>,
    pub faults: Faults,
}

impl FakeZoneLister {
    pub fn new<I, S>(zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            zones: zones.into_iter().map(Into::into).collect(),
            nodes: Mutex::new(HashMap::new()),
            faults: Faults::default(),
        }
    }

    pub fn add_node(&self, node: &str, zone: &str) {
        lock(&self.nodes).insert(node.to_string(), zone.to_string());
    }
}

#[async_trait]
impl ZoneLister for FakeZoneLister {
    async fn list_zones(&self) -> Result<Vec<String>> {
        self.faults.check("list_zones")?;
        Ok(self.zones.clone())
    }

    async fn get_zone_for_node(&self, node_name: &str) -> Result<String> {
        self.faults.check("get_zone_for_node")?;
        if let Some(zone) = lock(&self.nodes).get(node_name) {
            return Ok(zone.clone());
        }
        self.zones
            .first()
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("zone for node {}", node_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_log() {
        let log = CallLog::default();
        log.record("create_url_map", "k8s-um-a");
        log.record("delete_url_map", "k8s-um-a");
        log.record("create_url_map", "k8s-um-b");
        assert_eq!(log.of("create_url_map"), vec!["k8s-um-a", "k8s-um-b"]);
        assert_eq!(log.count("delete_url_map"), 1);
        assert_eq!(log.all().len(), 3);
    }

    #[tokio::test]
    async fn test_zone_lister_defaults_to_first_zone() {
        let zl = FakeZoneLister::new(["zone-a", "zone-b"]);
        zl.add_node("n2", "zone-b");
        assert_eq!(zl.get_zone_for_node("n1").await.unwrap(), "zone-a");
        assert_eq!(zl.get_zone_for_node("n2").await.unwrap(), "zone-b");

        zl.faults.set("list_zones", CloudError::internal("boom"));
        assert!(zl.list_zones().await.is_err());
    }
}
