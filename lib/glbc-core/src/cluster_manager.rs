//! Wires every pool together and drives one reconciliation pass.

use glbc_cloud::{BackendServices, Firewalls, InstanceGroup, InstanceGroups, LoadBalancers, ZoneLister};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::backends::{BackendPool, Backends, ServicePort};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::firewalls::{FirewallRules, SingleFirewallPool};
use crate::healthchecks::HealthChecks;
use crate::instances::{Instances, NodePool};
use crate::loadbalancers::{L7RuntimeInfo, L7s, LoadBalancerPool};
use crate::metrics::GlbcMetrics;
use crate::namer::Namer;

/// Cloud clients, one per resource family.
#[derive(Clone)]
pub struct CloudClients {
    pub backend_services: Arc<dyn BackendServices>,
    pub health_checks: Arc<dyn glbc_cloud::HealthChecks>,
    pub instance_groups: Arc<dyn InstanceGroups>,
    pub firewalls: Arc<dyn Firewalls>,
    pub load_balancers: Arc<dyn LoadBalancers>,
    pub zone_lister: Arc<dyn ZoneLister>,
}

/// Owns the cluster wide pools. Reconciliation passes are expected to come
/// from a single caller.
pub struct ClusterManager {
    namer: Arc<Namer>,
    default_backend_port: ServicePort,
    instance_pool: Arc<dyn NodePool>,
    backend_pool: Arc<dyn BackendPool>,
    l7_pool: Arc<dyn LoadBalancerPool>,
    firewall_pool: Arc<dyn SingleFirewallPool>,
    metrics: Option<GlbcMetrics>,
}

impl ClusterManager {
    pub fn new(config: &ControllerConfig, clouds: CloudClients) -> Result<Self> {
        config.validate()?;
        let namer = Arc::new(Namer::new(
            config.cluster_uid.clone(),
            config.effective_firewall_uid(),
        ));

        let instance_pool: Arc<dyn NodePool> = Arc::new(Instances::new(
            clouds.instance_groups.clone(),
            clouds.zone_lister.clone(),
        ));

        let health_checker = Arc::new(HealthChecks::new(
            clouds.health_checks.clone(),
            config.health_check_path.clone(),
            namer.clone(),
        ));
        let resync_period = config.resync_with_cloud.then(|| config.resync_period());
        // The default backend is collected by the L7 pool, not by port GC.
        let backend_pool: Arc<dyn BackendPool> = Arc::new(Backends::new(
            clouds.backend_services.clone(),
            health_checker,
            instance_pool.clone(),
            namer.clone(),
            &[config.default_backend_port.port],
            resync_period,
        ));

        let default_backend_health_checker = Arc::new(HealthChecks::new(
            clouds.health_checks.clone(),
            config.default_backend_health_check_path.clone(),
            namer.clone(),
        ));
        let default_backend_pool: Arc<dyn BackendPool> = Arc::new(Backends::new(
            clouds.backend_services.clone(),
            default_backend_health_checker,
            instance_pool.clone(),
            namer.clone(),
            &[],
            None,
        ));

        let l7_pool: Arc<dyn LoadBalancerPool> = Arc::new(L7s::new(
            clouds.load_balancers.clone(),
            default_backend_pool,
            config.default_backend_port.clone(),
            namer.clone(),
        ));

        let firewall_pool: Arc<dyn SingleFirewallPool> = Arc::new(FirewallRules::new(
            clouds.firewalls.clone(),
            namer.clone(),
            config.l7_source_ranges.clone(),
        ));

        Ok(Self {
            namer,
            default_backend_port: config.default_backend_port.clone(),
            instance_pool,
            backend_pool,
            l7_pool,
            firewall_pool,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: GlbcMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn namer(&self) -> &Arc<Namer> {
        &self.namer
    }

    pub fn backend_pool(&self) -> &Arc<dyn BackendPool> {
        &self.backend_pool
    }

    pub fn l7_pool(&self) -> &Arc<dyn LoadBalancerPool> {
        &self.l7_pool
    }

    pub fn instance_pool(&self) -> &Arc<dyn NodePool> {
        &self.instance_pool
    }

    /// Fails when the cloud can't be reached.
    pub async fn is_healthy(&self) -> Result<()> {
        self.backend_pool.list().await.map(|_| ())
    }

    /// Bring the cloud in line with the desired state:
    /// - `lbs` are the L7s that must exist, repaired if already there.
    /// - `node_names` are the members of the instance groups.
    /// - `service_ports` need a backend and an open node port each.
    ///
    /// Returns the instance groups every port was added to.
    pub async fn checkpoint(
        &self,
        lbs: &[L7RuntimeInfo],
        node_names: &[String],
        service_ports: &[ServicePort],
    ) -> Result<Vec<InstanceGroup>> {
        let start = Instant::now();
        let result = self.run_checkpoint(lbs, node_names, service_ports).await;
        self.record("checkpoint", result.is_ok(), start);
        result
    }

    async fn run_checkpoint(
        &self,
        lbs: &[L7RuntimeInfo],
        node_names: &[String],
        service_ports: &[ServicePort],
    ) -> Result<Vec<InstanceGroup>> {
        let igs = self.ensure_instance_groups_and_ports(service_ports).await?;
        self.backend_pool.sync(service_ports).await?;
        self.instance_pool.sync(node_names).await?;
        // A broken Ingress still lets the firewall follow the ports.
        let l7_result = self.l7_pool.sync(lbs).await;

        // No service ports means no Ingress needs the health check hole.
        let mut fw_ports: Vec<i64> = service_ports.iter().map(|p| p.port).collect();
        if !fw_ports.is_empty() {
            fw_ports.push(self.default_backend_port.port);
        }
        self.firewall_pool.sync(&fw_ports, node_names).await?;
        l7_result?;
        Ok(igs)
    }

    async fn ensure_instance_groups_and_ports(&self, service_ports: &[ServicePort]) -> Result<Vec<InstanceGroup>> {
        let ig_name = self.namer.ig_name();
        let mut igs = Vec::new();
        for port in service_ports {
            // Every call returns the same zonal groups, the last one carries
            // all named ports.
            let (groups, _) = self.instance_pool.add_instance_group(&ig_name, port.port).await?;
            igs = groups;
        }
        Ok(igs)
    }

    /// Delete every L7 not in `lb_names` and every backend not in
    /// `service_ports`. Backends are collected even when the L7s fail, the
    /// next pass may need the quota.
    pub async fn gc(&self, lb_names: &[String], service_ports: &[ServicePort]) -> Result<()> {
        let start = Instant::now();
        let mut errs = Vec::new();
        if let Err(e) = self.l7_pool.gc(lb_names).await {
            errs.push(e);
        }
        if let Err(e) = self.backend_pool.gc(service_ports).await {
            errs.push(e);
        }

        if service_ports.is_empty() {
            let ig_name = self.namer.ig_name();
            info!("Deleting instance group {}", ig_name);
            if let Err(e) = self.instance_pool.delete_instance_group(&ig_name).await {
                errs.push(e);
            }
        }

        let result = Error::from_list(errs);
        self.record("gc", result.is_ok(), start);
        result
    }

    /// Delete everything this cluster created.
    pub async fn shutdown(&self) -> Result<()> {
        let start = Instant::now();
        let result = self.run_shutdown().await;
        self.record("shutdown", result.is_ok(), start);
        result
    }

    async fn run_shutdown(&self) -> Result<()> {
        self.l7_pool.shutdown().await?;
        self.firewall_pool.shutdown().await?;
        self.backend_pool.shutdown().await?;
        self.instance_pool
            .delete_instance_group(&self.namer.ig_name())
            .await?;
        debug!("Cluster manager shut down");
        Ok(())
    }

    fn record(&self, phase: &str, ok: bool, start: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_reconcile(phase, ok, start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Protocol;
    use glbc_cloud::fakes::{
        FakeBackendServices, FakeFirewalls, FakeHealthChecks, FakeInstanceGroups, FakeLoadBalancers,
        FakeZoneLister,
    };
    use glbc_cloud::CloudError;

    struct Fixture {
        bs: Arc<FakeBackendServices>,
        igs: Arc<FakeInstanceGroups>,
        fws: Arc<FakeFirewalls>,
        lbs: Arc<FakeLoadBalancers>,
        cm: ClusterManager,
    }

    fn fixture() -> Fixture {
        let bs = Arc::new(FakeBackendServices::new());
        let igs = Arc::new(FakeInstanceGroups::new());
        let fws = Arc::new(FakeFirewalls::new());
        let lbs = Arc::new(FakeLoadBalancers::new());
        let clouds = CloudClients {
            backend_services: bs.clone(),
            health_checks: Arc::new(FakeHealthChecks::new()),
            instance_groups: igs.clone(),
            firewalls: fws.clone(),
            load_balancers: lbs.clone(),
            zone_lister: Arc::new(FakeZoneLister::new(["zone-a"])),
        };
        let config = ControllerConfig {
            cluster_uid: "uid1".to_string(),
            resync_with_cloud: false,
            ..Default::default()
        };
        let cm = ClusterManager::new(&config, clouds)
            .unwrap()
            .with_metrics(GlbcMetrics::new().unwrap());
        Fixture {
            bs,
            igs,
            fws,
            lbs,
            cm,
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let clouds = CloudClients {
            backend_services: Arc::new(FakeBackendServices::new()),
            health_checks: Arc::new(FakeHealthChecks::new()),
            instance_groups: Arc::new(FakeInstanceGroups::new()),
            firewalls: Arc::new(FakeFirewalls::new()),
            load_balancers: Arc::new(FakeLoadBalancers::new()),
            zone_lister: Arc::new(FakeZoneLister::new(["zone-a"])),
        };
        let config = ControllerConfig {
            cluster_uid: "bad--uid".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            ClusterManager::new(&config, clouds),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_without_ingresses() {
        let f = fixture();
        let igs = f.cm.checkpoint(&[], &[], &[]).await.unwrap();
        assert!(igs.is_empty());
        assert!(f.bs.names().is_empty());
        assert_eq!(f.lbs.resource_count(), 0);
        assert!(f.fws.names().is_empty());
    }

    #[tokio::test]
    async fn test_firewall_rule_follows_service_ports() {
        let f = fixture();
        let ports = vec![ServicePort::new(31000, Protocol::Http)];
        f.cm.checkpoint(&[], &[], &ports).await.unwrap();
        assert_eq!(f.fws.names(), vec!["k8s-fw-l7--uid1"]);

        f.cm.checkpoint(&[], &[], &[]).await.unwrap();
        assert!(f.fws.names().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_failure_still_allows_gc() {
        let f = fixture();
        f.lbs
            .faults
            .set("create_url_map", CloudError::quota_exceeded("url maps"));
        let ports = vec![ServicePort::new(31000, Protocol::Http)];
        let err = f
            .cm
            .checkpoint(&[L7RuntimeInfo::new("default/foo")], &[], &ports)
            .await
            .unwrap_err();
        assert!(!err.is_not_found());
        assert_eq!(f.igs.calls.count("create_instance_group"), 1);

        f.cm.gc(&[], &[]).await.unwrap();
        assert!(f.bs.names().is_empty());
        assert_eq!(f.lbs.resource_count(), 0);
    }

    #[tokio::test]
    async fn test_broken_ingress_still_opens_firewall() {
        let f = fixture();
        let mut bad = L7RuntimeInfo::new("default/bad");
        bad.tls_name = "missing-cert".to_string();
        let ports = vec![ServicePort::new(31000, Protocol::Http)];

        let err = f.cm.checkpoint(&[bad], &[], &ports).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(f.fws.names(), vec!["k8s-fw-l7--uid1"]);
    }

    #[tokio::test]
    async fn test_gc_runs_backend_phase_after_l7_failure() {
        let f = fixture();
        let ports = vec![ServicePort::new(31000, Protocol::Http)];
        f.cm
            .checkpoint(&[L7RuntimeInfo::new("default/foo")], &[], &ports)
            .await
            .unwrap();
        f.lbs
            .faults
            .set("delete_url_map", CloudError::internal("boom"));

        assert!(f.cm.gc(&[], &[]).await.is_err());
        // The user backend went away, the default backend is still referenced.
        assert_eq!(f.bs.names(), vec!["k8s-be-30000--uid1"]);

        let gathered = f.cm.metrics.as_ref().unwrap().gather().unwrap();
        assert!(gathered.contains("phase=\"gc\",result=\"error\""));
    }

    #[tokio::test]
    async fn test_is_healthy() {
        let f = fixture();
        f.cm.is_healthy().await.unwrap();
        f.bs
            .faults
            .set("list_backend_services", CloudError::internal("down"));
        assert!(f.cm.is_healthy().await.is_err());
    }
}
