use futures::future::join_all;
use glbc_cloud::{resource_name, NetworkEndpoint, NetworkEndpointGroup, NetworkEndpointGroupCloud, ZoneLister};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{
    calculate_difference, encode_endpoint, endpoint_batches, match_target_port, Endpoints,
    EndpointsGetter, NegServicePort, ZoneEndpointMap, NEG_ENDPOINT_TYPE,
};
use crate::config::NegConfig;
use crate::error::{Error, Result};
use crate::metrics::GlbcMetrics;

/// Exponential retry delay: doubles from `min` up to `max`, gives up after
/// `max_retries` consecutive failures.
#[derive(Clone, Debug)]
pub struct RetryBackoff {
    min: Duration,
    max: Duration,
    max_retries: u32,
    retry_count: u32,
    last_delay: Duration,
}

impl RetryBackoff {
    pub fn new(min: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            min,
            max,
            max_retries,
            retry_count: 0,
            last_delay: Duration::ZERO,
        }
    }

    pub fn from_config(config: &NegConfig) -> Self {
        Self::new(config.min_retry_delay(), config.max_retry_delay(), config.max_retries)
    }

    /// Delay before the next retry, or None once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retry_count > self.max_retries {
            return None;
        }
        self.retry_count += 1;
        self.last_delay = (self.last_delay * 2).clamp(self.min, self.max);
        Some(self.last_delay)
    }

    pub fn reset(&mut self) {
        self.retry_count = 0;
        self.last_delay = Duration::ZERO;
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_delay(&self) -> Duration {
        self.last_delay
    }
}

#[derive(Clone, Copy, Debug)]
enum EndpointOperation {
    Attach,
    Detach,
}

impl fmt::Display for EndpointOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointOperation::Attach => write!(f, "attach"),
            EndpointOperation::Detach => write!(f, "detach"),
        }
    }
}

#[derive(Debug)]
struct SyncerState {
    stopped: bool,
    shutting_down: bool,
    /// Dropped on stop, which closes the channel and ends the loop.
    sync_tx: Option<mpsc::Sender<()>>,
}

/// Keeps the NEGs of one service port in sync with its endpoints, from a
/// background task with its own retry schedule.
///
/// Lifecycle: stopped -> running -> shutting down -> stopped. `stop` only
/// flips the state and closes the wake-up channel; the task clears the
/// shutting down flag once it has exited.
pub struct Syncer {
    inner: Arc<SyncerInner>,
}

struct SyncerInner {
    port: NegServicePort,
    neg_name: String,
    cloud: Arc<dyn NetworkEndpointGroupCloud>,
    zone_lister: Arc<dyn ZoneLister>,
    endpoints: Arc<dyn EndpointsGetter>,
    config: NegConfig,
    metrics: Option<GlbcMetrics>,
    state: Mutex<SyncerState>,
}

impl Syncer {
    pub fn new(
        port: NegServicePort,
        neg_name: impl Into<String>,
        cloud: Arc<dyn NetworkEndpointGroupCloud>,
        zone_lister: Arc<dyn ZoneLister>,
        endpoints: Arc<dyn EndpointsGetter>,
        config: NegConfig,
        metrics: Option<GlbcMetrics>,
    ) -> Self {
        let neg_name = neg_name.into();
        debug!("New syncer for service port {} NEG {}", port, neg_name);
        Self {
            inner: Arc::new(SyncerInner {
                port,
                neg_name,
                cloud,
                zone_lister,
                endpoints,
                config,
                metrics,
                state: Mutex::new(SyncerState {
                    stopped: true,
                    shutting_down: false,
                    sync_tx: None,
                }),
            }),
        }
    }

    pub fn neg_name(&self) -> &str {
        &self.inner.neg_name
    }

    pub fn service_port(&self) -> &NegServicePort {
        &self.inner.port
    }

    /// Spawn the sync loop on the current tokio runtime. Fails if the syncer
    /// is running or still shutting down.
    pub fn start(&self) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::Syncer(format!("cannot start NEG syncer for {}: {}", self.inner.port, e))
        })?;
        let rx = {
            let mut state = self.inner.state();
            if !state.stopped {
                return Err(Error::Syncer(format!(
                    "NEG syncer for {} is already running",
                    self.inner.port
                )));
            }
            if state.shutting_down {
                return Err(Error::Syncer(format!(
                    "NEG syncer for {} is shutting down",
                    self.inner.port
                )));
            }
            let (tx, rx) = mpsc::channel(1);
            state.stopped = false;
            state.sync_tx = Some(tx);
            rx
        };

        info!("Starting NEG syncer for service port {}", self.inner.port);
        if let Some(metrics) = &self.inner.metrics {
            metrics.neg_syncers.inc();
        }
        handle.spawn(run(self.inner.clone(), rx));
        Ok(())
    }

    pub fn stop(&self) {
        let mut state = self.inner.state();
        if !state.stopped {
            info!("Stopping NEG syncer for {}", self.inner.port);
            state.stopped = true;
            state.shutting_down = true;
            state.sync_tx = None;
        }
    }

    /// Ask the loop to sync as soon as possible. Returns false if the syncer
    /// is stopped or a wake-up is already pending.
    pub fn sync(&self) -> bool {
        let state = self.inner.state();
        match &state.sync_tx {
            Some(tx) if !state.stopped => {
                debug!("Sync requested for {}", self.inner.port);
                tx.try_send(()).is_ok()
            }
            _ => {
                warn!("NEG syncer for {} is already stopped", self.inner.port);
                false
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }
}

async fn run(inner: Arc<SyncerInner>, mut rx: mpsc::Receiver<()>) {
    let mut backoff = RetryBackoff::from_config(&inner.config);
    loop {
        let result = inner.sync().await;
        if let Some(metrics) = &inner.metrics {
            metrics.record_neg_sync(result.is_ok());
        }
        let retry_delay = match result {
            Ok(()) => {
                backoff.reset();
                None
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        "Failed to sync NEG {} (will retry in {:?}): {}",
                        inner.neg_name, delay, e
                    );
                    Some(delay)
                }
                None => {
                    error!("Failed to sync NEG {} (will not retry): {}", inner.neg_name, e);
                    None
                }
            },
        };

        let closed = match retry_delay {
            Some(delay) => tokio::select! {
                msg = rx.recv() => msg.is_none(),
                _ = tokio::time::sleep(delay) => false,
            },
            None => rx.recv().await.is_none(),
        };
        if closed {
            inner.state().shutting_down = false;
            if let Some(metrics) = &inner.metrics {
                metrics.neg_syncers.dec();
            }
            info!("NEG syncer for {} stopped", inner.port);
            return;
        }
    }
}

impl SyncerInner {
    fn state(&self) -> MutexGuard<'_, SyncerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    async fn sync(&self) -> Result<()> {
        if self.is_stopped() || self.is_shutting_down() {
            debug!("Skip syncing NEG {} for {}", self.neg_name, self.port);
            return Ok(());
        }
        self.sync_endpoints().await
    }

    async fn sync_endpoints(&self) -> Result<()> {
        info!("Sync NEG {} for {}", self.neg_name, self.port);
        let Some(endpoints) = self
            .endpoints
            .get_endpoints(&self.port.namespace, &self.port.name)
            .await?
        else {
            warn!(
                "Endpoints {}/{} do not exist, skipping NEG sync",
                self.port.namespace, self.port.name
            );
            return Ok(());
        };

        self.ensure_network_endpoint_groups().await?;
        let target = self.to_zone_endpoint_map(&endpoints).await?;
        let current = self.existing_zone_endpoint_map().await?;

        let (add, remove) = calculate_difference(&target, &current);
        if add.is_empty() && remove.is_empty() {
            debug!("No endpoint change for {}, skip syncing NEG", self.port);
            return Ok(());
        }
        self.sync_network_endpoints(&add, &remove).await
    }

    /// Make sure the NEG exists in every zone and sits on the cluster's
    /// network. One on another network is recreated.
    async fn ensure_network_endpoint_groups(&self) -> Result<()> {
        let network = self.cloud.network_url();
        let subnetwork = self.cloud.subnetwork_url();
        let mut errs = Vec::new();

        for zone in self.zone_lister.list_zones().await? {
            let existing = match self.cloud.get_network_endpoint_group(&self.neg_name, &zone).await {
                Ok(neg) => Some(neg),
                Err(e) => {
                    debug!("Error while retrieving NEG {} in zone {}: {}", self.neg_name, zone, e);
                    None
                }
            };

            // Names only, links differ between API versions.
            let need_to_create = match existing {
                None => true,
                Some(neg)
                    if resource_name(&neg.network) != resource_name(&network)
                        || resource_name(&neg.subnetwork) != resource_name(&subnetwork) =>
                {
                    info!(
                        "NEG {} in {} does not match network and subnetwork of the cluster, deleting",
                        self.neg_name, zone
                    );
                    match self
                        .cloud
                        .delete_network_endpoint_group(&self.neg_name, &zone)
                        .await
                    {
                        Ok(()) => true,
                        Err(e) => {
                            errs.push(e.into());
                            false
                        }
                    }
                }
                Some(_) => false,
            };

            if need_to_create {
                info!("Creating NEG {} for {} in {}", self.neg_name, self.port, zone);
                let neg = NetworkEndpointGroup {
                    name: self.neg_name.clone(),
                    network_endpoint_type: NEG_ENDPOINT_TYPE.to_string(),
                    network: network.clone(),
                    subnetwork: subnetwork.clone(),
                    ..Default::default()
                };
                if let Err(e) = self.cloud.create_network_endpoint_group(&neg, &zone).await {
                    errs.push(e.into());
                }
            }
        }
        Error::from_list(errs)
    }

    /// Endpoints serving the target port, by the zone of their node.
    async fn to_zone_endpoint_map(&self, endpoints: &Endpoints) -> Result<ZoneEndpointMap> {
        let mut map = ZoneEndpointMap::new();
        for subset in &endpoints.subsets {
            let Some(port) = match_target_port(subset, &self.port.target_port) else {
                continue;
            };
            for address in &subset.addresses {
                let Some(node) = &address.node_name else {
                    warn!("Endpoint {} of {} has no node, skipping", address.ip, self.port);
                    continue;
                };
                let zone = self.zone_lister.get_zone_for_node(node).await?;
                map.entry(zone)
                    .or_default()
                    .insert(encode_endpoint(&address.ip, node, &port));
            }
        }
        Ok(map)
    }

    async fn existing_zone_endpoint_map(&self) -> Result<ZoneEndpointMap> {
        let mut map = ZoneEndpointMap::new();
        for zone in self.zone_lister.list_zones().await? {
            let endpoints = self
                .cloud
                .list_network_endpoints(&self.neg_name, &zone)
                .await?;
            map.insert(
                zone,
                endpoints
                    .iter()
                    .map(|ne| encode_endpoint(&ne.ip_address, &ne.instance, &ne.port.to_string()))
                    .collect(),
            );
        }
        Ok(map)
    }

    /// Detach and attach in batches. All batches run concurrently and every
    /// failure is reported.
    async fn sync_network_endpoints(&self, add: &ZoneEndpointMap, remove: &ZoneEndpointMap) -> Result<()> {
        let mut operations = Vec::new();
        for (zone, endpoints) in remove {
            for batch in endpoint_batches(endpoints, self.config.batch_size)? {
                operations.push(self.operate(EndpointOperation::Detach, zone, batch));
            }
        }
        for (zone, endpoints) in add {
            for batch in endpoint_batches(endpoints, self.config.batch_size)? {
                operations.push(self.operate(EndpointOperation::Attach, zone, batch));
            }
        }

        let errs: Vec<Error> = join_all(operations)
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .collect();
        Error::from_list(errs)
    }

    async fn operate(&self, op: EndpointOperation, zone: &str, endpoints: Vec<NetworkEndpoint>) -> Result<()> {
        let result = match op {
            EndpointOperation::Attach => {
                self.cloud
                    .attach_network_endpoints(&self.neg_name, zone, &endpoints)
                    .await
            }
            EndpointOperation::Detach => {
                self.cloud
                    .detach_network_endpoints(&self.neg_name, zone, &endpoints)
                    .await
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_endpoint_operation(&op.to_string(), result.is_ok());
        }
        match &result {
            Ok(()) => info!(
                "{} {} network endpoints to NEG {} in {}",
                op,
                endpoints.len(),
                self.neg_name,
                zone
            ),
            Err(e) => warn!(
                "Failed to {} {} network endpoints to NEG {} in {}: {}",
                op,
                endpoints.len(),
                self.neg_name,
                zone,
                e
            ),
        }
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neg::testing::{endpoints, FakeEndpoints};
    use glbc_cloud::fakes::{FakeNetworkEndpointGroupCloud, FakeZoneLister};
    use glbc_cloud::CloudError;
    use std::collections::BTreeSet;

    struct Fixture {
        cloud: Arc<FakeNetworkEndpointGroupCloud>,
        eps: Arc<FakeEndpoints>,
        syncer: Syncer,
    }

    fn fixture(target_port: &str) -> Fixture {
        let cloud = Arc::new(FakeNetworkEndpointGroupCloud::new());
        let zones = Arc::new(FakeZoneLister::new(["zone1", "zone2"]));
        zones.add_node("n1", "zone1");
        zones.add_node("n2", "zone2");
        let eps = Arc::new(FakeEndpoints::default());
        let syncer = Syncer::new(
            NegServicePort::new("default", "web", target_port),
            "k8s1-uid-default-web-80-hash",
            cloud.clone(),
            zones,
            eps.clone(),
            NegConfig::default(),
            None,
        );
        Fixture { cloud, eps, syncer }
    }

    fn ep(ip: &str, instance: &str, port: i64) -> NetworkEndpoint {
        NetworkEndpoint {
            ip_address: ip.to_string(),
            instance: instance.to_string(),
            port,
        }
    }

    fn attached(f: &Fixture, zone: &str) -> BTreeSet<NetworkEndpoint> {
        f.cloud
            .endpoints(f.syncer.neg_name(), zone)
            .unwrap_or_default()
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not met");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = RetryBackoff::from_config(&NegConfig::default());
        let delays: Vec<u64> = (0..8)
            .map(|_| backoff.next_delay().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300]);

        backoff.reset();
        assert_eq!(backoff.retry_count(), 0);
        assert_eq!(backoff.last_delay(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_backoff_gives_up() {
        let mut backoff = RetryBackoff::new(Duration::from_secs(1), Duration::from_secs(4), 2);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
    }

    #[tokio::test]
    async fn test_sync_converges() {
        let f = fixture("80");
        f.eps.put(endpoints("default", "web", &[("10.0.0.1", "n1"), ("10.0.0.2", "n2")], "http", 80));

        f.syncer.inner.sync_endpoints().await.unwrap();
        assert_eq!(f.cloud.calls.count("create_network_endpoint_group"), 2);
        assert_eq!(f.cloud.calls.count("attach_network_endpoints"), 2);
        assert_eq!(f.cloud.calls.count("detach_network_endpoints"), 0);
        assert_eq!(attached(&f, "zone1"), BTreeSet::from([ep("10.0.0.1", "n1", 80)]));
        assert_eq!(attached(&f, "zone2"), BTreeSet::from([ep("10.0.0.2", "n2", 80)]));

        f.cloud.calls.clear();
        f.syncer.inner.sync_endpoints().await.unwrap();
        assert!(f.cloud.calls.all().is_empty());
    }

    #[tokio::test]
    async fn test_sync_detaches_stale_endpoints() {
        let f = fixture("http");
        f.eps.put(endpoints("default", "web", &[("10.0.0.1", "n1"), ("10.0.0.3", "n1")], "http", 8080));
        f.syncer.inner.sync_endpoints().await.unwrap();

        f.eps.put(endpoints("default", "web", &[("10.0.0.1", "n1")], "http", 8080));
        f.cloud.calls.clear();
        f.syncer.inner.sync_endpoints().await.unwrap();
        assert_eq!(f.cloud.calls.all(), vec![format!("detach_network_endpoints:zone1/{}", f.syncer.neg_name())]);
        assert_eq!(attached(&f, "zone1"), BTreeSet::from([ep("10.0.0.1", "n1", 8080)]));
    }

    #[tokio::test]
    async fn test_unmatched_port_detaches_everything() {
        let f = fixture("80");
        f.eps.put(endpoints("default", "web", &[("10.0.0.1", "n1")], "http", 80));
        f.syncer.inner.sync_endpoints().await.unwrap();

        f.eps.put(endpoints("default", "web", &[("10.0.0.1", "n1")], "http", 8080));
        f.syncer.inner.sync_endpoints().await.unwrap();
        assert!(attached(&f, "zone1").is_empty());
    }

    #[tokio::test]
    async fn test_missing_endpoints_skip_sync() {
        let f = fixture("80");
        f.syncer.inner.sync_endpoints().await.unwrap();
        assert!(f.cloud.calls.all().is_empty());
    }

    #[tokio::test]
    async fn test_network_mismatch_recreates_neg() {
        let f = fixture("80");
        f.eps.put(endpoints("default", "web", &[("10.0.0.1", "n1")], "http", 80));
        f.syncer.inner.sync_endpoints().await.unwrap();

        f.cloud.set_network("projects/p/global/networks/other", "projects/p/regions/r/subnetworks/other");
        f.cloud.calls.clear();
        f.syncer.inner.sync_endpoints().await.unwrap();
        assert_eq!(f.cloud.calls.count("delete_network_endpoint_group"), 2);
        assert_eq!(f.cloud.calls.count("create_network_endpoint_group"), 2);
        assert_eq!(attached(&f, "zone1"), BTreeSet::from([ep("10.0.0.1", "n1", 80)]));
    }

    #[tokio::test]
    async fn test_failed_batches_are_aggregated() {
        let f = fixture("80");
        f.eps.put(endpoints("default", "web", &[("10.0.0.1", "n1"), ("10.0.0.2", "n2")], "http", 80));
        f.cloud
            .faults
            .set("attach_network_endpoints", CloudError::internal("boom"));
        let err = f.syncer.inner.sync_endpoints().await.unwrap_err();
        assert!(matches!(err, Error::Aggregate(ref errs) if errs.len() == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle() {
        let f = fixture("80");
        f.eps.put(endpoints("default", "web", &[("10.0.0.1", "n1")], "http", 80));
        assert!(f.syncer.is_stopped());
        assert!(!f.syncer.sync());

        f.syncer.start().unwrap();
        assert!(f.syncer.start().is_err());
        wait_for(|| !attached(&f, "zone1").is_empty()).await;

        f.syncer.stop();
        assert!(f.syncer.is_stopped());
        assert!(!f.syncer.sync());
        wait_for(|| !f.syncer.is_shutting_down()).await;

        f.eps.put(endpoints("default", "web", &[("10.0.0.2", "n1")], "http", 80));
        f.syncer.start().unwrap();
        wait_for(|| attached(&f, "zone1") == BTreeSet::from([ep("10.0.0.2", "n1", 80)])).await;
        f.syncer.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_signal_wakes_loop() {
        let f = fixture("80");
        f.eps.put(endpoints("default", "web", &[("10.0.0.1", "n1")], "http", 80));
        f.syncer.start().unwrap();
        wait_for(|| !attached(&f, "zone1").is_empty()).await;

        f.eps.put(endpoints("default", "web", &[("10.0.0.1", "n1"), ("10.0.0.2", "n2")], "http", 80));
        assert!(f.syncer.sync());
        wait_for(|| !attached(&f, "zone2").is_empty()).await;
        f.syncer.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sync_is_retried() {
        let f = fixture("80");
        f.eps.put(endpoints("default", "web", &[("10.0.0.1", "n1")], "http", 80));
        f.cloud
            .faults
            .set("attach_network_endpoints", CloudError::internal("boom"));
        f.syncer.start().unwrap();
        wait_for(|| f.cloud.calls.count("attach_network_endpoints") >= 1).await;
        assert!(attached(&f, "zone1").is_empty());

        f.cloud.faults.clear("attach_network_endpoints");
        wait_for(|| !attached(&f, "zone1").is_empty()).await;
        f.syncer.stop();
    }
}
