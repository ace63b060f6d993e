//! Zonal instance groups holding the cluster's nodes

use async_trait::async_trait;
use glbc_cloud::{resource_name, InstanceGroup, InstanceGroups, NamedPort, ZoneLister};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::storage::{InMemoryPool, Snapshotter};

/// Manages one logical instance group that spans every zone of the cluster.
#[async_trait]
pub trait NodePool: Send + Sync {
    /// Get or create the group in every zone and make sure each one carries
    /// the named port. Returns one group per zone.
    async fn add_instance_group(&self, name: &str, port: i64) -> Result<(Vec<InstanceGroup>, NamedPort)>;
    /// Delete the group from every zone.
    async fn delete_instance_group(&self, name: &str) -> Result<()>;
    /// Add nodes to the group of their zone.
    async fn add(&self, group_name: &str, names: &[String]) -> Result<()>;
    /// Remove nodes from the group of their zone.
    async fn remove(&self, group_name: &str, names: &[String]) -> Result<()>;
    /// Make membership of every tracked group match the given nodes.
    async fn sync(&self, nodes: &[String]) -> Result<()>;
    async fn get(&self, name: &str, zone: &str) -> Result<InstanceGroup>;
}

pub fn named_port_for(port: i64) -> NamedPort {
    NamedPort {
        name: format!("port{}", port),
        port,
    }
}

/// NodePool backed by unmanaged zonal instance groups.
pub struct Instances {
    cloud: Arc<dyn InstanceGroups>,
    zone_lister: Arc<dyn ZoneLister>,
    snapshotter: InMemoryPool<()>,
}

impl Instances {
    pub fn new(cloud: Arc<dyn InstanceGroups>, zone_lister: Arc<dyn ZoneLister>) -> Self {
        Self {
            cloud,
            zone_lister,
            snapshotter: InMemoryPool::new(),
        }
    }

    /// Names of the instances in the group, across all zones. Zones where
    /// the group is missing contribute nothing.
    async fn list(&self, name: &str) -> Result<BTreeSet<String>> {
        let mut node_names = BTreeSet::new();
        for zone in self.zone_lister.list_zones().await? {
            let instances = match self.cloud.list_instances_in_instance_group(name, &zone).await {
                Ok(instances) => instances,
                Err(e) if e.is_not_found() => {
                    debug!("Instance group {} not found in zone {}: {}", name, zone, e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            for link in &instances {
                node_names.insert(resource_name(link).to_string());
            }
        }
        Ok(node_names)
    }

    async fn split_nodes_by_zone(&self, names: &[String]) -> BTreeMap<String, Vec<String>> {
        let mut nodes_by_zone: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in names {
            match self.zone_lister.get_zone_for_node(name).await {
                Ok(zone) => nodes_by_zone.entry(zone).or_default().push(name.clone()),
                Err(e) => error!("Failed to get zone for {}: {}, skipping", name, e),
            }
        }
        nodes_by_zone
    }

    async fn sync_group(&self, ig_name: &str, kube_nodes: &BTreeSet<String>) -> Result<()> {
        let gce_nodes = self.list(ig_name).await?;

        // A node deleted from the cluster can still exist as a VM, and a new
        // node must start receiving traffic.
        let remove_nodes: Vec<String> = gce_nodes.difference(kube_nodes).cloned().collect();
        let add_nodes: Vec<String> = kube_nodes.difference(&gce_nodes).cloned().collect();
        if !remove_nodes.is_empty() {
            self.remove(ig_name, &remove_nodes).await?;
        }
        if !add_nodes.is_empty() {
            self.add(ig_name, &add_nodes).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl NodePool for Instances {
    async fn add_instance_group(&self, name: &str, port: i64) -> Result<(Vec<InstanceGroup>, NamedPort)> {
        let named_port = named_port_for(port);
        let mut igs = Vec::new();

        for zone in self.zone_lister.list_zones().await? {
            let mut ig = match self.cloud.get_instance_group(name, &zone).await {
                Ok(ig) => {
                    debug!("Instance group {} already exists in zone {}", name, zone);
                    ig
                }
                Err(e) if e.is_not_found() => {
                    info!("Creating instance group {} in zone {}", name, zone);
                    self.cloud.create_instance_group(name, &zone).await?
                }
                Err(e) => return Err(e.into()),
            };
            self.snapshotter.add(name, ()).await;

            if !ig.named_ports.iter().any(|np| np.port == port) {
                info!("Adding port {} to instance group {} in zone {}", port, name, zone);
                let mut ports = ig.named_ports.clone();
                ports.push(named_port.clone());
                self.cloud
                    .set_named_ports_of_instance_group(name, &zone, &ports)
                    .await?;
                ig.named_ports = ports;
            }
            igs.push(ig);
        }
        Ok((igs, named_port))
    }

    async fn delete_instance_group(&self, name: &str) -> Result<()> {
        let mut errs = Vec::new();
        let mut in_use = false;
        for zone in self.zone_lister.list_zones().await? {
            info!("Deleting instance group {} in zone {}", name, zone);
            match self.cloud.delete_instance_group(name, &zone).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!("Instance group {} in zone {} already deleted", name, zone);
                }
                Err(e) if e.is_in_use() => {
                    warn!("Instance group {} in zone {} is still in use, skipping", name, zone);
                    in_use = true;
                }
                Err(e) => errs.push(Error::from(e)),
            }
        }
        // Node sync keeps maintaining a group that survived in some zone.
        if !in_use && errs.is_empty() {
            self.snapshotter.delete(name).await;
        }
        Error::from_list(errs)
    }

    async fn add(&self, group_name: &str, names: &[String]) -> Result<()> {
        let mut errs = Vec::new();
        for (zone, node_names) in self.split_nodes_by_zone(names).await {
            info!("Adding nodes {:?} to {} in zone {}", node_names, group_name, zone);
            if let Err(e) = self
                .cloud
                .add_instances_to_instance_group(group_name, &zone, &node_names)
                .await
            {
                errs.push(e.into());
            }
        }
        Error::from_list(errs)
    }

    async fn remove(&self, group_name: &str, names: &[String]) -> Result<()> {
        let mut errs = Vec::new();
        for (zone, node_names) in self.split_nodes_by_zone(names).await {
            info!("Removing nodes {:?} from {} in zone {}", node_names, group_name, zone);
            if let Err(e) = self
                .cloud
                .remove_instances_from_instance_group(group_name, &zone, &node_names)
                .await
            {
                errs.push(e.into());
            }
        }
        Error::from_list(errs)
    }

    async fn sync(&self, nodes: &[String]) -> Result<()> {
        debug!("Syncing nodes {:?}", nodes);
        let kube_nodes: BTreeSet<String> = nodes.iter().cloned().collect();

        for ig_name in self.snapshotter.snapshot().await.keys() {
            match self.sync_group(ig_name, &kube_nodes).await {
                Ok(()) => {}
                // The node pool never creates or deletes groups, so a missing
                // group is left for the backend pool to recreate.
                Err(e) if e.is_not_found() => {
                    info!("Node pool encountered a 404, ignoring: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn get(&self, name: &str, zone: &str) -> Result<InstanceGroup> {
        let ig = self.cloud.get_instance_group(name, zone).await?;
        self.snapshotter.add(name, ()).await;
        Ok(ig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glbc_cloud::fakes::{FakeInstanceGroups, FakeZoneLister};
    use glbc_cloud::CloudError;

    fn setup() -> (Arc<FakeInstanceGroups>, Arc<FakeZoneLister>, Instances) {
        let cloud = Arc::new(FakeInstanceGroups::new());
        let zones = Arc::new(FakeZoneLister::new(["zone-a", "zone-b"]));
        let pool = Instances::new(cloud.clone(), zones.clone());
        (cloud, zones, pool)
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_add_instance_group_in_every_zone() {
        let (cloud, _zones, pool) = setup();
        let (igs, np) = pool.add_instance_group("k8s-ig", 30001).await.unwrap();
        assert_eq!(igs.len(), 2);
        assert_eq!(np.name, "port30001");

        pool.add_instance_group("k8s-ig", 30002).await.unwrap();
        pool.add_instance_group("k8s-ig", 30002).await.unwrap();
        for zone in ["zone-a", "zone-b"] {
            let ports: Vec<i64> = cloud
                .named_ports("k8s-ig", zone)
                .unwrap()
                .iter()
                .map(|np| np.port)
                .collect();
            assert_eq!(ports, vec![30001, 30002]);
        }
        assert_eq!(cloud.calls.count("create_instance_group"), 2);
        assert_eq!(cloud.calls.count("set_named_ports_of_instance_group"), 4);
    }

    #[tokio::test]
    async fn test_sync_nodes_by_zone() {
        let (cloud, zones, pool) = setup();
        zones.add_node("n2", "zone-b");
        pool.add_instance_group("k8s-ig", 30001).await.unwrap();

        pool.sync(&names(&["n1", "n2"])).await.unwrap();
        assert_eq!(cloud.instance_names("k8s-ig", "zone-a").unwrap(), vec!["n1"]);
        assert_eq!(cloud.instance_names("k8s-ig", "zone-b").unwrap(), vec!["n2"]);

        pool.sync(&names(&["n2", "n3"])).await.unwrap();
        assert_eq!(cloud.instance_names("k8s-ig", "zone-a").unwrap(), vec!["n3"]);
        assert_eq!(cloud.instance_names("k8s-ig", "zone-b").unwrap(), vec!["n2"]);

        cloud.calls.clear();
        pool.sync(&names(&["n2", "n3"])).await.unwrap();
        assert!(cloud.calls.all().is_empty());
    }

    #[tokio::test]
    async fn test_sync_ignores_missing_group() {
        let (cloud, _zones, pool) = setup();
        pool.add_instance_group("k8s-ig", 30001).await.unwrap();
        cloud.delete_instance_group("k8s-ig", "zone-a").await.unwrap();
        pool.sync(&names(&["n1"])).await.unwrap();

        cloud.faults.set(
            "list_instances_in_instance_group",
            CloudError::internal("boom"),
        );
        assert!(pool.sync(&names(&["n1"])).await.is_err());
    }

    #[tokio::test]
    async fn test_sync_reaches_zones_past_a_missing_group() {
        let (cloud, zones, pool) = setup();
        zones.add_node("n2", "zone-b");
        pool.add_instance_group("k8s-ig", 30001).await.unwrap();
        cloud.delete_instance_group("k8s-ig", "zone-a").await.unwrap();

        pool.sync(&names(&["n1", "n2"])).await.unwrap();
        assert_eq!(cloud.instance_names("k8s-ig", "zone-b").unwrap(), vec!["n2"]);
    }

    #[tokio::test]
    async fn test_group_in_use_stays_tracked() {
        let (cloud, _zones, pool) = setup();
        pool.add_instance_group("k8s-ig", 30001).await.unwrap();
        cloud
            .faults
            .set("delete_instance_group", CloudError::in_use("k8s-ig"));
        pool.delete_instance_group("k8s-ig").await.unwrap();
        cloud.faults.clear("delete_instance_group");

        pool.sync(&names(&["n1"])).await.unwrap();
        assert_eq!(cloud.instance_names("k8s-ig", "zone-a").unwrap(), vec!["n1"]);

        pool.delete_instance_group("k8s-ig").await.unwrap();
        cloud.calls.clear();
        pool.sync(&names(&["n1"])).await.unwrap();
        assert!(cloud.calls.all().is_empty());
    }

    #[tokio::test]
    async fn test_delete_instance_group_tolerates_missing_and_in_use() {
        let (cloud, _zones, pool) = setup();
        pool.add_instance_group("k8s-ig", 30001).await.unwrap();
        cloud.delete_instance_group("k8s-ig", "zone-b").await.unwrap();
        pool.delete_instance_group("k8s-ig").await.unwrap();
        assert!(!cloud.exists("k8s-ig", "zone-a"));

        pool.add_instance_group("k8s-ig", 30001).await.unwrap();
        cloud
            .faults
            .set("delete_instance_group", CloudError::in_use("k8s-ig"));
        pool.delete_instance_group("k8s-ig").await.unwrap();

        cloud
            .faults
            .set("delete_instance_group", CloudError::internal("boom"));
        let err = pool.delete_instance_group("k8s-ig").await.unwrap_err();
        assert!(matches!(err, Error::Aggregate(ref errs) if errs.len() == 2));
    }
}
