//! Fake zonal network endpoint groups

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use super::{global_link, lock, zonal_link, CallLog, Faults, PROJECT_LINK};
use crate::error::{CloudError, Result};
use crate::interfaces::NetworkEndpointGroupCloud;
use crate::resources::*;

#[derive(Debug)]
struct FakeNeg {
    neg: NetworkEndpointGroup,
    endpoints: BTreeSet<NetworkEndpoint>,
}

/// NEGs keyed by (zone, name). The network and subnetwork the fake reports
/// as the cluster's can be changed to exercise mismatch handling.
#[derive(Debug)]
pub struct FakeNetworkEndpointGroupCloud {
    negs: Mutex<BTreeMap<(String, String), FakeNeg>>,
    network: Mutex<String>,
    subnetwork: Mutex<String>,
    pub calls: CallLog,
    pub faults: Faults,
}

impl Default for FakeNetworkEndpointGroupCloud {
    fn default() -> Self {
        Self {
            negs: Mutex::new(BTreeMap::new()),
            network: Mutex::new(global_link("networks", "default")),
            subnetwork: Mutex::new(format!("{}/regions/us-central1/subnetworks/default", PROJECT_LINK)),
            calls: CallLog::default(),
            faults: Faults::default(),
        }
    }
}

impl FakeNetworkEndpointGroupCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_network(&self, network: &str, subnetwork: &str) {
        *lock(&self.network) = network.to_string();
        *lock(&self.subnetwork) = subnetwork.to_string();
    }

    /// Store a NEG directly, e.g. one left behind by an earlier run.
    pub fn put(&self, neg: NetworkEndpointGroup, zone: &str) {
        let mut neg = neg;
        neg.zone = zone.to_string();
        neg.self_link = zonal_link(zone, "networkEndpointGroups", &neg.name);
        lock(&self.negs).insert(
            (zone.to_string(), neg.name.clone()),
            FakeNeg {
                neg,
                endpoints: BTreeSet::new(),
            },
        );
    }

    pub fn exists(&self, name: &str, zone: &str) -> bool {
        lock(&self.negs).contains_key(&(zone.to_string(), name.to_string()))
    }

    /// Endpoints currently attached, or None if the NEG doesn't exist.
    pub fn endpoints(&self, name: &str, zone: &str) -> Option<BTreeSet<NetworkEndpoint>> {
        lock(&self.negs)
            .get(&(zone.to_string(), name.to_string()))
            .map(|n| n.endpoints.clone())
    }

    /// Every (zone, name) pair stored.
    pub fn keys(&self) -> Vec<(String, String)> {
        lock(&self.negs).keys().cloned().collect()
    }

    fn not_found(name: &str, zone: &str) -> CloudError {
        CloudError::not_found(format!("network endpoint group {} in {}", name, zone))
    }
}

#[async_trait]
impl NetworkEndpointGroupCloud for FakeNetworkEndpointGroupCloud {
    async fn aggregated_list_network_endpoint_groups(&self) -> Result<BTreeMap<String, Vec<NetworkEndpointGroup>>> {
        self.faults.check("aggregated_list_network_endpoint_groups")?;
        let mut by_zone: BTreeMap<String, Vec<NetworkEndpointGroup>> = BTreeMap::new();
        for ((zone, _), n) in lock(&self.negs).iter() {
            by_zone.entry(zone.clone()).or_default().push(n.neg.clone());
        }
        Ok(by_zone)
    }

    async fn get_network_endpoint_group(&self, name: &str, zone: &str) -> Result<NetworkEndpointGroup> {
        self.faults.check("get_network_endpoint_group")?;
        lock(&self.negs)
            .get(&(zone.to_string(), name.to_string()))
            .map(|n| n.neg.clone())
            .ok_or_else(|| Self::not_found(name, zone))
    }

    async fn create_network_endpoint_group(&self, neg: &NetworkEndpointGroup, zone: &str) -> Result<()> {
        self.calls
            .record("create_network_endpoint_group", &format!("{}/{}", zone, neg.name));
        self.faults.check("create_network_endpoint_group")?;
        let mut negs = lock(&self.negs);
        let key = (zone.to_string(), neg.name.clone());
        if negs.contains_key(&key) {
            return Err(CloudError::conflict(format!(
                "network endpoint group {} exists in {}",
                neg.name, zone
            )));
        }
        let mut created = neg.clone();
        created.zone = zone.to_string();
        created.self_link = zonal_link(zone, "networkEndpointGroups", &neg.name);
        negs.insert(
            key,
            FakeNeg {
                neg: created,
                endpoints: BTreeSet::new(),
            },
        );
        Ok(())
    }

    async fn delete_network_endpoint_group(&self, name: &str, zone: &str) -> Result<()> {
        self.calls
            .record("delete_network_endpoint_group", &format!("{}/{}", zone, name));
        self.faults.check("delete_network_endpoint_group")?;
        lock(&self.negs)
            .remove(&(zone.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(name, zone))
    }

    async fn attach_network_endpoints(&self, name: &str, zone: &str, endpoints: &[NetworkEndpoint]) -> Result<()> {
        self.calls
            .record("attach_network_endpoints", &format!("{}/{}", zone, name));
        self.faults.check("attach_network_endpoints")?;
        let mut negs = lock(&self.negs);
        let n = negs
            .get_mut(&(zone.to_string(), name.to_string()))
            .ok_or_else(|| Self::not_found(name, zone))?;
        n.endpoints.extend(endpoints.iter().cloned());
        n.neg.size = n.endpoints.len() as i64;
        Ok(())
    }

    async fn detach_network_endpoints(&self, name: &str, zone: &str, endpoints: &[NetworkEndpoint]) -> Result<()> {
        self.calls
            .record("detach_network_endpoints", &format!("{}/{}", zone, name));
        self.faults.check("detach_network_endpoints")?;
        let mut negs = lock(&self.negs);
        let n = negs
            .get_mut(&(zone.to_string(), name.to_string()))
            .ok_or_else(|| Self::not_found(name, zone))?;
        for ep in endpoints {
            n.endpoints.remove(ep);
        }
        n.neg.size = n.endpoints.len() as i64;
        Ok(())
    }

    async fn list_network_endpoints(&self, name: &str, zone: &str) -> Result<Vec<NetworkEndpoint>> {
        self.faults.check("list_network_endpoints")?;
        lock(&self.negs)
            .get(&(zone.to_string(), name.to_string()))
            .map(|n| n.endpoints.iter().cloned().collect())
            .ok_or_else(|| Self::not_found(name, zone))
    }

    fn network_url(&self) -> String {
        lock(&self.network).clone()
    }

    fn subnetwork_url(&self) -> String {
        lock(&self.subnetwork).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attach_and_detach() {
        let cloud = FakeNetworkEndpointGroupCloud::new();
        let neg = NetworkEndpointGroup {
            name: "neg".to_string(),
            network_endpoint_type: "GCE_VM_IP_PORT".to_string(),
            network: cloud.network_url(),
            ..Default::default()
        };
        cloud.create_network_endpoint_group(&neg, "zone-a").await.unwrap();

        let ep = |ip: &str| NetworkEndpoint {
            ip_address: ip.to_string(),
            instance: "n1".to_string(),
            port: 8080,
        };
        cloud
            .attach_network_endpoints("neg", "zone-a", &[ep("10.0.0.1"), ep("10.0.0.2")])
            .await
            .unwrap();
        cloud
            .detach_network_endpoints("neg", "zone-a", &[ep("10.0.0.1")])
            .await
            .unwrap();

        let listed = cloud.list_network_endpoints("neg", "zone-a").await.unwrap();
        assert_eq!(listed, vec![ep("10.0.0.2")]);
        assert_eq!(cloud.get_network_endpoint_group("neg", "zone-a").await.unwrap().size, 1);
        assert!(cloud
            .list_network_endpoints("neg", "zone-b")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
