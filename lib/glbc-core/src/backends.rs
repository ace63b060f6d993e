//! Backend services, one per node port
//!
//! The backend name is derived from the node port alone, so Ingresses that
//! route to the same port share one backend service.

use async_trait::async_trait;
use glbc_cloud::{Backend, BackendService, BackendServices, BalancingMode, InstanceGroup, NamedPort};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::healthchecks::HealthChecker;
use crate::instances::NodePool;
use crate::namer::Namer;
use crate::storage::{CloudLister, CloudListingPool, InMemoryPool, KeyFunc, Snapshotter};

/// Protocol spoken between the load balancer and the backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "HTTP"),
            Protocol::Https => write!(f, "HTTPS"),
        }
    }
}

/// One routable unit of traffic: a node port and the protocol it speaks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePort {
    pub port: i64,
    pub protocol: Protocol,
    /// namespace/name of the Service behind the port
    pub service_name: String,
    /// Port of the Service, by name or number
    pub service_port: String,
}

impl ServicePort {
    pub fn new(port: i64, protocol: Protocol) -> Self {
        Self {
            port,
            protocol,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait BackendPool: Send + Sync {
    /// Get or create the backend for the port and repair its links.
    async fn add(&self, port: &ServicePort) -> Result<()>;
    async fn get(&self, port: i64) -> Result<BackendService>;
    async fn delete(&self, port: i64) -> Result<()>;
    async fn sync(&self, ports: &[ServicePort]) -> Result<()>;
    /// Delete every tracked backend whose port is neither given nor ignored.
    async fn gc(&self, ports: &[ServicePort]) -> Result<()>;
    async fn shutdown(&self) -> Result<()>;
    /// Health of the first instance group behind the backend, "Unknown" on
    /// any error.
    async fn status(&self, name: &str) -> String;
    async fn list(&self) -> Result<Vec<BackendService>>;
}

fn port_key(port: i64) -> String {
    port.to_string()
}

/// Lists backend services for a relisting snapshotter.
pub struct BackendServiceLister {
    cloud: Arc<dyn BackendServices>,
}

impl BackendServiceLister {
    pub fn new(cloud: Arc<dyn BackendServices>) -> Self {
        Self { cloud }
    }
}

#[async_trait]
impl CloudLister<BackendService> for BackendServiceLister {
    async fn list(&self) -> Result<Vec<BackendService>> {
        Ok(self.cloud.list_backend_services().await?)
    }
}

/// Pool key of a listed backend, if it belongs to this cluster.
pub fn backend_key_fn(namer: Arc<Namer>) -> KeyFunc<BackendService> {
    Arc::new(move |bs: &BackendService| {
        if !namer.name_belongs_to_cluster(&bs.name) {
            return Err(Error::InvalidName(format!("Unrecognized name {}", bs.name)));
        }
        namer.be_port(&bs.name).map(port_key)
    })
}

/// BackendPool backed by cloud backend services.
pub struct Backends {
    cloud: Arc<dyn BackendServices>,
    node_pool: Arc<dyn NodePool>,
    health_checker: Arc<dyn HealthChecker>,
    snapshotter: Box<dyn Snapshotter<BackendService>>,
    /// Ports excluded from GC. `delete` still deletes them.
    ignored_ports: HashSet<i64>,
    namer: Arc<Namer>,
}

impl Backends {
    /// With a `resync_period` the pool relists backend services from the
    /// cloud, so backends left behind by an earlier controller get collected.
    pub fn new(
        cloud: Arc<dyn BackendServices>,
        health_checker: Arc<dyn HealthChecker>,
        node_pool: Arc<dyn NodePool>,
        namer: Arc<Namer>,
        ignored_ports: &[i64],
        resync_period: Option<Duration>,
    ) -> Self {
        let snapshotter: Box<dyn Snapshotter<BackendService>> = match resync_period {
            Some(period) => Box::new(CloudListingPool::new(
                Arc::new(BackendServiceLister::new(cloud.clone())),
                backend_key_fn(namer.clone()),
                period,
            )),
            None => Box::new(InMemoryPool::new()),
        };
        Self::with_snapshotter(cloud, health_checker, node_pool, namer, ignored_ports, snapshotter)
    }

    pub fn with_snapshotter(
        cloud: Arc<dyn BackendServices>,
        health_checker: Arc<dyn HealthChecker>,
        node_pool: Arc<dyn NodePool>,
        namer: Arc<Namer>,
        ignored_ports: &[i64],
        snapshotter: Box<dyn Snapshotter<BackendService>>,
    ) -> Self {
        Self {
            cloud,
            node_pool,
            health_checker,
            snapshotter,
            ignored_ports: ignored_ports.iter().copied().collect(),
            namer,
        }
    }

    /// Create with RATE; on a 400 retry the same request with UTILIZATION,
    /// the mode siblings on the same groups are likely using.
    async fn create(
        &self,
        igs: &[InstanceGroup],
        named_port: &NamedPort,
        protocol: Protocol,
        hc_link: &str,
        name: &str,
    ) -> Result<BackendService> {
        let mut backend = BackendService {
            name: name.to_string(),
            protocol: protocol.to_string(),
            port: named_port.port,
            port_name: named_port.name.clone(),
            health_checks: vec![hc_link.to_string()],
            ..Default::default()
        };
        for mode in [BalancingMode::Rate, BalancingMode::Utilization] {
            backend.backends = backends_for_igs(igs, mode);
            match self.cloud.create_backend_service(&backend).await {
                Ok(()) => return self.get(named_port.port).await,
                Err(e) if e.is_bad_request() && mode == BalancingMode::Rate => {
                    info!(
                        "Creating backend {} with balancing mode {} failed, retrying with {}: {}",
                        name,
                        mode,
                        BalancingMode::Utilization,
                        e
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.get(named_port.port).await
    }

    async fn ensure(&self, sp: &ServicePort, tracked: &mut BackendService) -> Result<()> {
        self.health_checker.add(sp.port, sp.protocol).await?;
        let hc = self.health_checker.get(sp.port).await?;

        let (igs, named_port) = self
            .node_pool
            .add_instance_group(&self.namer.ig_name(), sp.port)
            .await?;

        let name = self.namer.be_name(sp.port);
        let mut be = match self.cloud.get_backend_service(&name).await {
            Ok(be) => be,
            Err(e) if e.is_not_found() => {
                info!(
                    "Creating backend for {} instance groups, port {} named port {:?}",
                    igs.len(),
                    sp.port,
                    named_port
                );
                self.create(&igs, &named_port, sp.protocol, &hc.self_link, &name)
                    .await?
            }
            Err(e) => return Err(e.into()),
        };
        *tracked = be.clone();

        let protocol = sp.protocol.to_string();
        if be.protocol != protocol || be.health_checks != [hc.self_link.clone()] {
            info!(
                "Updating backend {} protocol {} -> {}, health checks {:?} -> {}",
                name, be.protocol, protocol, be.health_checks, hc.self_link
            );
            be.protocol = protocol;
            be.health_checks = vec![hc.self_link.clone()];
            self.cloud.update_backend_service(&be).await?;
            *tracked = be.clone();
        }

        // No groups until the node pool has synced nodes.
        if igs.is_empty() {
            return Ok(());
        }
        self.edge_hop(&mut be, &igs).await?;
        *tracked = be;
        Ok(())
    }

    /// Add links to groups the backend is missing. Links to groups we don't
    /// know about are left alone.
    async fn edge_hop(&self, be: &mut BackendService, igs: &[InstanceGroup]) -> Result<()> {
        let be_igs: BTreeSet<&str> = be.backends.iter().map(|b| b.group.as_str()).collect();
        let missing: Vec<&str> = igs
            .iter()
            .map(|ig| ig.self_link.as_str())
            .filter(|link| !be_igs.contains(link))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        info!(
            "Backend {} has a broken edge, expected igs {:?}, current igs {:?}",
            be.name,
            igs.iter().map(|ig| ig.self_link.as_str()).collect::<Vec<_>>(),
            be_igs
        );

        // New links follow the mode already in use on the backend.
        let modes = match be.backends.first() {
            Some(b) => vec![b.balancing_mode],
            None => vec![BalancingMode::Rate, BalancingMode::Utilization],
        };
        let last = modes.len() - 1;
        for (i, mode) in modes.into_iter().enumerate() {
            let mut updated = be.clone();
            updated
                .backends
                .extend(missing.iter().map(|link| Backend::for_group(*link, mode)));
            match self.cloud.update_backend_service(&updated).await {
                Ok(()) => {
                    *be = updated;
                    return Ok(());
                }
                Err(e) if e.is_bad_request() && i < last => {
                    info!("Updating backend {} with mode {} failed, retrying: {}", be.name, mode, e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn backends_for_igs(igs: &[InstanceGroup], mode: BalancingMode) -> Vec<Backend> {
    igs.iter()
        .map(|ig| Backend::for_group(ig.self_link.clone(), mode))
        .collect()
}

#[async_trait]
impl BackendPool for Backends {
    async fn add(&self, sp: &ServicePort) -> Result<()> {
        // Track the port even if creation fails, a health check may already
        // exist for it.
        let mut tracked = BackendService {
            name: self.namer.be_name(sp.port),
            ..Default::default()
        };
        let result = self.ensure(sp, &mut tracked).await;
        self.snapshotter.add(&port_key(sp.port), tracked).await;
        result
    }

    async fn get(&self, port: i64) -> Result<BackendService> {
        let be = self.cloud.get_backend_service(&self.namer.be_name(port)).await?;
        self.snapshotter.add(&port_key(port), be.clone()).await;
        Ok(be)
    }

    async fn delete(&self, port: i64) -> Result<()> {
        let name = self.namer.be_name(port);
        info!("Deleting backend {}", name);
        match self.cloud.delete_backend_service(&name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Backend {} already deleted", name),
            Err(e) if e.is_in_use() => {
                // Whoever references it will release it, GC retries later.
                warn!("Backend {} is still in use, skipping: {}", name, e);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        match self.health_checker.delete(port).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Health check {} already deleted", name),
            Err(e) => return Err(e),
        }
        self.snapshotter.delete(&port_key(port)).await;
        Ok(())
    }

    async fn sync(&self, ports: &[ServicePort]) -> Result<()> {
        debug!("Sync: backends {:?}", ports.iter().map(|p| p.port).collect::<Vec<_>>());
        let mut errs = Vec::new();
        for port in ports {
            if let Err(e) = self.add(port).await {
                warn!("Failed to sync backend for port {}: {}", port.port, e);
                errs.push(e);
            }
        }
        Error::from_list(errs)
    }

    async fn gc(&self, ports: &[ServicePort]) -> Result<()> {
        let known: HashSet<i64> = ports.iter().map(|p| p.port).collect();
        let mut errs = Vec::new();
        for key in self.snapshotter.snapshot().await.keys() {
            let port: i64 = match key.parse() {
                Ok(port) => port,
                Err(_) => {
                    errs.push(Error::InvalidName(format!("backend pool key {}", key)));
                    continue;
                }
            };
            if known.contains(&port) || self.ignored_ports.contains(&port) {
                continue;
            }
            debug!("GCing backend for port {}", port);
            if let Err(e) = self.delete(port).await {
                errs.push(e);
            }
        }
        Error::from_list(errs)
    }

    async fn shutdown(&self) -> Result<()> {
        self.gc(&[]).await
    }

    async fn status(&self, name: &str) -> String {
        const UNKNOWN: &str = "Unknown";
        let backend = match self.cloud.get_backend_service(name).await {
            Ok(be) => be,
            Err(_) => return UNKNOWN.to_string(),
        };
        let Some(first) = backend.backends.first() else {
            return UNKNOWN.to_string();
        };
        match self.cloud.get_health(name, &first.group).await {
            Ok(hs) => hs
                .health_status
                .first()
                .map(|s| s.health_state.clone())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            Err(_) => UNKNOWN.to_string(),
        }
    }

    async fn list(&self) -> Result<Vec<BackendService>> {
        Ok(self.cloud.list_backend_services().await?)
    }
}
