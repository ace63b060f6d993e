//! HTTP(S) load balancers, one per Ingress
//!
//! Every L7 routes unmatched traffic to a shared default backend, which is
//! created with the first L7 and deleted with the last.

mod l7;
mod url_map;

pub use l7::{L7RuntimeInfo, TlsCerts, ANNOTATION_PREFIX, L7};
pub use url_map::{path_matcher_name, GceUrlMap, DEFAULT_HOST, DEFAULT_PATH};

use async_trait::async_trait;
use glbc_cloud::{BackendService, LoadBalancers};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::backends::{BackendPool, ServicePort};
use crate::error::{Error, Result};
use crate::namer::Namer;
use crate::storage::{InMemoryPool, Snapshotter};

#[async_trait]
pub trait LoadBalancerPool: Send + Sync {
    async fn get(&self, name: &str) -> Result<L7>;
    /// Create or repair the L7 described by the runtime info.
    async fn add(&self, ri: &L7RuntimeInfo) -> Result<()>;
    async fn delete(&self, name: &str) -> Result<()>;
    /// Add every L7, ensuring the default backend first.
    async fn sync(&self, ris: &[L7RuntimeInfo]) -> Result<()>;
    /// Delete every L7 not named. With no names the default backend goes too.
    async fn gc(&self, names: &[String]) -> Result<()>;
    async fn shutdown(&self) -> Result<()>;
    async fn update_url_map(&self, name: &str, rules: &GceUrlMap) -> Result<()>;
}

/// LoadBalancerPool that tracks L7s in memory.
pub struct L7s {
    cloud: Arc<dyn LoadBalancers>,
    snapshotter: InMemoryPool<L7>,
    glbc_default_backend: RwLock<Option<BackendService>>,
    default_backend_pool: Arc<dyn BackendPool>,
    default_backend_port: ServicePort,
    namer: Arc<Namer>,
}

impl L7s {
    pub fn new(
        cloud: Arc<dyn LoadBalancers>,
        default_backend_pool: Arc<dyn BackendPool>,
        default_backend_port: ServicePort,
        namer: Arc<Namer>,
    ) -> Self {
        Self {
            cloud,
            snapshotter: InMemoryPool::new(),
            glbc_default_backend: RwLock::new(None),
            default_backend_pool,
            default_backend_port,
            namer,
        }
    }

    /// Create or repair the default backend and remember it.
    async fn ensure_default_backend(&self) -> Result<BackendService> {
        self.default_backend_pool
            .add(&self.default_backend_port)
            .await?;
        let backend = self
            .default_backend_pool
            .get(self.default_backend_port.port)
            .await?;
        *self.glbc_default_backend.write().await = Some(backend.clone());
        Ok(backend)
    }

    pub async fn default_backend(&self) -> Option<BackendService> {
        self.glbc_default_backend.read().await.clone()
    }
}

#[async_trait]
impl LoadBalancerPool for L7s {
    async fn get(&self, name: &str) -> Result<L7> {
        let name = self.namer.lb_name(name);
        self.snapshotter
            .get(&name)
            .await
            .ok_or(Error::LoadBalancerNotFound(name))
    }

    async fn add(&self, ri: &L7RuntimeInfo) -> Result<()> {
        let name = self.namer.lb_name(&ri.name);
        let mut lb = match self.snapshotter.get(&name).await {
            Some(mut lb) => {
                if lb.runtime_info() != ri {
                    info!("Updating load balancer {} runtime info", name);
                }
                lb.set_runtime_info(ri.clone());
                lb
            }
            None => {
                info!("Creating l7 {}", name);
                L7::new(name.clone(), ri.clone(), self.cloud.clone(), self.namer.clone())
            }
        };

        let default_backend = match self.default_backend().await {
            Some(be) => be,
            None => self.ensure_default_backend().await?,
        };
        lb.set_default_backend(Some(default_backend));

        let result = lb.edge_hop().await;
        // Whatever was created so far must stay reachable for cleanup.
        self.snapshotter.add(&name, lb).await;
        result
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let name = self.namer.lb_name(name);
        let Some(mut lb) = self.snapshotter.get(&name).await else {
            debug!("Load balancer {} not in pool, nothing to delete", name);
            return Ok(());
        };
        info!("Deleting lb {}", name);
        match lb.cleanup().await {
            Ok(()) => {
                self.snapshotter.delete(&name).await;
                Ok(())
            }
            Err(e) => {
                self.snapshotter.add(&name, lb).await;
                Err(e)
            }
        }
    }

    async fn sync(&self, ris: &[L7RuntimeInfo]) -> Result<()> {
        debug!(
            "Syncing loadbalancers {:?}",
            ris.iter().map(|ri| ri.name.as_str()).collect::<Vec<_>>()
        );
        if !ris.is_empty() {
            // Repaired on every pass, a user may have deleted it.
            self.ensure_default_backend().await?;
        }
        let mut errs = Vec::new();
        for ri in ris {
            if let Err(e) = self.add(ri).await {
                warn!("Failed to sync loadbalancer {}: {}", ri.name, e);
                errs.push(e);
            }
        }
        Error::from_list(errs)
    }

    async fn gc(&self, names: &[String]) -> Result<()> {
        let known: HashSet<String> = names.iter().map(|n| self.namer.lb_name(n)).collect();
        let mut errs = Vec::new();
        for key in self.snapshotter.snapshot().await.keys() {
            if known.contains(key) {
                continue;
            }
            debug!("GCing loadbalancer {}", key);
            if let Err(e) = self.delete(key).await {
                errs.push(e);
            }
        }
        if !errs.is_empty() {
            return Error::from_list(errs);
        }

        // The default backend is only referenced by url maps, all gone now.
        if names.is_empty() {
            self.default_backend_pool
                .delete(self.default_backend_port.port)
                .await?;
            *self.glbc_default_backend.write().await = None;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.gc(&[]).await?;
        self.default_backend_pool.shutdown().await?;
        info!("Loadbalancer pool shutdown.");
        Ok(())
    }

    async fn update_url_map(&self, name: &str, rules: &GceUrlMap) -> Result<()> {
        let mut lb = self.get(name).await?;
        let result = lb.update_url_map(rules).await;
        self.snapshotter.add(lb.name(), lb.clone()).await;
        result
    }
}
