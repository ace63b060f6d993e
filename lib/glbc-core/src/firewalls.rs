//! The single cluster-wide firewall rule that lets health checks and proxies
//! reach the node ports.

use async_trait::async_trait;
use glbc_cloud::{Firewall, FirewallAllowed, Firewalls};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::namer::Namer;

#[async_trait]
pub trait SingleFirewallPool: Send + Sync {
    /// Open the node ports to the source ranges on the given nodes. With no
    /// ports the rule is deleted.
    async fn sync(&self, node_ports: &[i64], node_names: &[String]) -> Result<()>;
    async fn shutdown(&self) -> Result<()>;
}

pub struct FirewallRules {
    cloud: Arc<dyn Firewalls>,
    namer: Arc<Namer>,
    src_ranges: Vec<String>,
}

impl FirewallRules {
    pub fn new(cloud: Arc<dyn Firewalls>, namer: Arc<Namer>, src_ranges: Vec<String>) -> Self {
        Self {
            cloud,
            namer,
            src_ranges,
        }
    }

    fn desired(&self, name: &str, ports: &BTreeSet<String>, target_tags: Vec<String>) -> Firewall {
        Firewall {
            name: name.to_string(),
            description: "GCE L7 firewall rule".to_string(),
            network: self.cloud.network_url(),
            source_ranges: self.src_ranges.clone(),
            target_tags,
            allowed: vec![FirewallAllowed {
                ip_protocol: "tcp".to_string(),
                ports: ports.iter().cloned().collect(),
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl SingleFirewallPool for FirewallRules {
    async fn sync(&self, node_ports: &[i64], node_names: &[String]) -> Result<()> {
        if node_ports.is_empty() {
            return self.shutdown().await;
        }
        let name = self.namer.firewall_rule_name();
        let ports: BTreeSet<String> = node_ports.iter().map(|p| p.to_string()).collect();
        let target_tags = self.cloud.get_node_tags(node_names).await?;
        let desired = self.desired(&name, &ports, target_tags);

        let existing = match self.cloud.get_firewall(&name).await {
            Ok(fw) => fw,
            Err(e) if e.is_not_found() => {
                info!("Creating global l7 firewall rule {}", name);
                self.cloud.create_firewall(&desired).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // Target tags are not compared against the current nodes.
        let existing_ports: BTreeSet<String> = existing
            .allowed
            .iter()
            .flat_map(|a| a.ports.iter().cloned())
            .collect();
        let existing_ranges: BTreeSet<&String> = existing.source_ranges.iter().collect();
        let desired_ranges: BTreeSet<&String> = self.src_ranges.iter().collect();
        if existing_ports == ports && existing_ranges == desired_ranges {
            debug!("Firewall rule {} already exists", name);
            return Ok(());
        }

        info!(
            "Firewall rule {} has ports {:?} and ranges {:?}, updating to {:?} and {:?}",
            name, existing_ports, existing_ranges, ports, desired_ranges
        );
        self.cloud.update_firewall(&desired).await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let name = self.namer.firewall_rule_name();
        info!("Deleting firewall rule {}", name);
        match self.cloud.delete_firewall(&name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("Firewall rule {} already deleted", name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_L7_SOURCE_RANGES;
    use glbc_cloud::fakes::FakeFirewalls;

    fn setup() -> (Arc<FakeFirewalls>, FirewallRules) {
        let cloud = Arc::new(FakeFirewalls::new());
        let namer = Arc::new(Namer::new("uid1", ""));
        let ranges = DEFAULT_L7_SOURCE_RANGES.iter().map(|s| s.to_string()).collect();
        let pool = FirewallRules::new(cloud.clone(), namer, ranges);
        (cloud, pool)
    }

    fn nodes(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_sync_creates_then_noops() {
        let (cloud, pool) = setup();
        pool.sync(&[30001, 30002], &nodes(&["n1"])).await.unwrap();
        pool.sync(&[30002, 30001], &nodes(&["n1"])).await.unwrap();

        assert_eq!(cloud.calls.count("create_firewall"), 1);
        assert_eq!(cloud.calls.count("update_firewall"), 0);
        let fw = cloud.get_firewall("k8s-fw-l7--uid1").await.unwrap();
        assert_eq!(fw.allowed[0].ports, vec!["30001", "30002"]);
        assert_eq!(fw.source_ranges, vec!["130.211.0.0/22", "35.191.0.0/16"]);
        assert_eq!(fw.target_tags, vec!["n1"]);
    }

    #[tokio::test]
    async fn test_update_only_when_ports_or_ranges_differ() {
        let (cloud, pool) = setup();
        pool.sync(&[30001], &nodes(&["n1"])).await.unwrap();

        pool.sync(&[30001, 30003], &nodes(&["n1"])).await.unwrap();
        pool.sync(&[30001, 30003], &nodes(&["n1"])).await.unwrap();
        assert_eq!(cloud.calls.count("update_firewall"), 1);

        // Only the node set changed: left alone.
        pool.sync(&[30001, 30003], &nodes(&["n1", "n2"])).await.unwrap();
        assert_eq!(cloud.calls.count("update_firewall"), 1);

        let mut fw = cloud.get_firewall("k8s-fw-l7--uid1").await.unwrap();
        fw.source_ranges = vec!["0.0.0.0/0".to_string()];
        cloud.put(fw);
        pool.sync(&[30001, 30003], &nodes(&["n1"])).await.unwrap();
        assert_eq!(cloud.calls.count("update_firewall"), 2);
        let fw = cloud.get_firewall("k8s-fw-l7--uid1").await.unwrap();
        assert_eq!(fw.source_ranges.len(), 2);
    }

    #[tokio::test]
    async fn test_no_ports_deletes_rule() {
        let (cloud, pool) = setup();
        pool.sync(&[30001], &nodes(&["n1"])).await.unwrap();
        pool.sync(&[], &nodes(&["n1"])).await.unwrap();
        assert!(cloud.names().is_empty());

        // Already gone.
        pool.sync(&[], &nodes(&["n1"])).await.unwrap();
    }
}
