use glbc_cloud::{NetworkEndpointGroupCloud, ZoneLister};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

use super::{EndpointsGetter, NegServicePort, Syncer};
use crate::config::NegConfig;
use crate::error::{Error, Result};
use crate::metrics::GlbcMetrics;
use crate::namer::Namer;

#[derive(Default)]
struct ManagerState {
    /// (namespace, name) -> target ports that need a NEG. The source of
    /// truth for which NEGs must exist.
    svc_port_map: HashMap<(String, String), BTreeSet<String>>,
    syncer_map: HashMap<NegServicePort, Syncer>,
}

/// Starts, stops and garbage collects NEG syncers. A single lock guards
/// both maps.
pub struct SyncerManager {
    namer: Arc<Namer>,
    cloud: Arc<dyn NetworkEndpointGroupCloud>,
    zone_lister: Arc<dyn ZoneLister>,
    endpoints: Arc<dyn EndpointsGetter>,
    config: NegConfig,
    metrics: Option<GlbcMetrics>,
    state: Mutex<ManagerState>,
}

impl SyncerManager {
    pub fn new(
        namer: Arc<Namer>,
        cloud: Arc<dyn NetworkEndpointGroupCloud>,
        zone_lister: Arc<dyn ZoneLister>,
        endpoints: Arc<dyn EndpointsGetter>,
        config: NegConfig,
        metrics: Option<GlbcMetrics>,
    ) -> Self {
        Self {
            namer,
            cloud,
            zone_lister,
            endpoints,
            config,
            metrics,
            state: Mutex::new(ManagerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a syncer for exactly the given target ports of the service:
    /// syncers of dropped ports are stopped, every wanted port whose syncer
    /// is stopped gets it started. A syncer still shutting down fails to
    /// start and is retried on the next call.
    pub fn ensure_syncer(&self, namespace: &str, name: &str, target_ports: &BTreeSet<String>) -> Result<()> {
        let mut state = self.state();
        let key = (namespace.to_string(), name.to_string());
        let current = state.svc_port_map.insert(key, target_ports.clone()).unwrap_or_default();

        for port in current.difference(target_ports) {
            if let Some(syncer) = state.syncer_map.get(&NegServicePort::new(namespace, name, port)) {
                syncer.stop();
            }
        }

        let mut errs = Vec::new();
        for port in target_ports {
            let svc_port = NegServicePort::new(namespace, name, port);
            let syncer = state.syncer_map.entry(svc_port.clone()).or_insert_with(|| {
                Syncer::new(
                    svc_port,
                    self.namer.neg_name(namespace, name, port),
                    self.cloud.clone(),
                    self.zone_lister.clone(),
                    self.endpoints.clone(),
                    self.config.clone(),
                    self.metrics.clone(),
                )
            });
            if syncer.is_stopped() {
                if let Err(e) = syncer.start() {
                    errs.push(e);
                }
            }
        }
        Error::from_list(errs)
    }

    /// Stop every syncer of the service and forget its ports.
    pub fn stop_syncer(&self, namespace: &str, name: &str) {
        let mut state = self.state();
        let key = (namespace.to_string(), name.to_string());
        let Some(ports) = state.svc_port_map.remove(&key) else {
            return;
        };
        info!("Stopping NEG syncers for service {}/{}", namespace, name);
        for port in &ports {
            if let Some(syncer) = state.syncer_map.get(&NegServicePort::new(namespace, name, port)) {
                syncer.stop();
            }
        }
    }

    /// Wake up every running syncer of the service.
    pub fn sync(&self, namespace: &str, name: &str) {
        let state = self.state();
        let Some(ports) = state.svc_port_map.get(&(namespace.to_string(), name.to_string())) else {
            return;
        };
        for port in ports {
            if let Some(syncer) = state.syncer_map.get(&NegServicePort::new(namespace, name, port)) {
                if !syncer.is_stopped() {
                    syncer.sync();
                }
            }
        }
    }

    pub fn shutdown(&self) {
        for syncer in self.state().syncer_map.values() {
            syncer.stop();
        }
    }

    /// Service ports with a running syncer, sorted.
    pub fn running_syncers(&self) -> Vec<NegServicePort> {
        let mut ports: Vec<NegServicePort> = self
            .state()
            .syncer_map
            .iter()
            .filter(|(_, s)| !s.is_stopped())
            .map(|(p, _)| p.clone())
            .collect();
        ports.sort();
        ports
    }

    pub fn syncer_count(&self) -> usize {
        self.state().syncer_map.len()
    }

    /// Drop syncers that finished shutting down, then delete the NEGs no
    /// service asks for anymore.
    pub async fn gc(&self) -> Result<()> {
        debug!("Start NEG garbage collection");
        self.state()
            .syncer_map
            .retain(|_, s| !(s.is_stopped() && !s.is_shutting_down()));

        if let Err(e) = self.garbage_collect_negs().await {
            error!("Failed to garbage collect NEGs: {}", e);
            return Err(e);
        }
        debug!("NEG garbage collection finished");
        Ok(())
    }

    async fn garbage_collect_negs(&self) -> Result<()> {
        let zone_negs = self.cloud.aggregated_list_network_endpoint_groups().await?;
        let mut neg_names: BTreeSet<String> = zone_negs
            .values()
            .flatten()
            .filter(|neg| self.namer.is_neg(&neg.name))
            .map(|neg| neg.name.clone())
            .collect();

        {
            let state = self.state();
            for ((namespace, name), ports) in &state.svc_port_map {
                for port in ports {
                    neg_names.remove(&self.namer.neg_name(namespace, name, port));
                }
            }
            // A syncer still winding down may touch its NEG once more.
            for syncer in state.syncer_map.values() {
                if !syncer.is_stopped() || syncer.is_shutting_down() {
                    neg_names.remove(syncer.neg_name());
                }
            }
        }

        for zone in zone_negs.keys() {
            for name in &neg_names {
                self.ensure_delete_network_endpoint_group(name, zone)
                    .await
                    .map_err(|e| Error::Syncer(format!("failed to delete NEG {} in {}: {}", name, zone, e)))?;
            }
        }
        Ok(())
    }

    async fn ensure_delete_network_endpoint_group(&self, name: &str, zone: &str) -> Result<()> {
        if let Err(e) = self.cloud.get_network_endpoint_group(name, zone).await {
            debug!("NEG {} not found in {}, nothing to delete: {}", name, zone, e);
            return Ok(());
        }
        info!("Deleting NEG {} in {}", name, zone);
        self.cloud.delete_network_endpoint_group(name, zone).await?;
        Ok(())
    }
}
