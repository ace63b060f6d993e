//! HTTP(S) health checks, one per backend port

use async_trait::async_trait;
use glbc_cloud::HealthCheck;
use std::sync::Arc;
use tracing::{debug, info};

use crate::backends::Protocol;
use crate::error::Result;
use crate::namer::Namer;

pub const DEFAULT_CHECK_INTERVAL_SEC: i64 = 60;
pub const DEFAULT_TIMEOUT_SEC: i64 = 60;
pub const DEFAULT_HEALTHY_THRESHOLD: i64 = 1;
/// Ten failed probes a minute apart before an instance is marked unhealthy.
pub const DEFAULT_UNHEALTHY_THRESHOLD: i64 = 10;

/// Produces the health check a backend service links to.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Ensure a health check exists for the port.
    async fn add(&self, port: i64, protocol: Protocol) -> Result<()>;
    async fn get(&self, port: i64) -> Result<HealthCheck>;
    async fn delete(&self, port: i64) -> Result<()>;
}

/// Health checks named after the backend they serve.
pub struct HealthChecks {
    cloud: Arc<dyn glbc_cloud::HealthChecks>,
    request_path: String,
    namer: Arc<Namer>,
}

impl HealthChecks {
    pub fn new(
        cloud: Arc<dyn glbc_cloud::HealthChecks>,
        request_path: impl Into<String>,
        namer: Arc<Namer>,
    ) -> Self {
        Self {
            cloud,
            request_path: request_path.into(),
            namer,
        }
    }

    fn default_health_check(&self, port: i64, protocol: Protocol) -> HealthCheck {
        HealthCheck {
            name: self.namer.be_name(port),
            description: "Default kubernetes L7 Loadbalancing health check.".to_string(),
            kind: protocol.to_string(),
            port,
            request_path: self.request_path.clone(),
            check_interval_sec: DEFAULT_CHECK_INTERVAL_SEC,
            timeout_sec: DEFAULT_TIMEOUT_SEC,
            healthy_threshold: DEFAULT_HEALTHY_THRESHOLD,
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
            ..Default::default()
        }
    }
}

#[async_trait]
impl HealthChecker for HealthChecks {
    async fn add(&self, port: i64, protocol: Protocol) -> Result<()> {
        let name = self.namer.be_name(port);
        match self.cloud.get_health_check(&name).await {
            Ok(existing) => {
                if existing.kind != protocol.to_string() {
                    // Keep everything a user may have tuned, request path included.
                    info!(
                        "Updating health check {} protocol from {} to {}",
                        name, existing.kind, protocol
                    );
                    let updated = HealthCheck {
                        kind: protocol.to_string(),
                        ..existing
                    };
                    self.cloud.update_health_check(&updated).await?;
                } else {
                    debug!("Health check {} already exists", name);
                }
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!("Creating health check {} for port {}", name, port);
                self.cloud
                    .create_health_check(&self.default_health_check(port, protocol))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, port: i64) -> Result<HealthCheck> {
        Ok(self.cloud.get_health_check(&self.namer.be_name(port)).await?)
    }

    async fn delete(&self, port: i64) -> Result<()> {
        let name = self.namer.be_name(port);
        info!("Deleting health check {}", name);
        Ok(self.cloud.delete_health_check(&name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glbc_cloud::fakes::FakeHealthChecks;

    fn setup() -> (Arc<FakeHealthChecks>, HealthChecks) {
        let cloud = Arc::new(FakeHealthChecks::new());
        let namer = Arc::new(Namer::new("uid1", ""));
        let hcs = HealthChecks::new(cloud.clone(), "/", namer);
        (cloud, hcs)
    }

    #[tokio::test]
    async fn test_add_creates_once() {
        let (cloud, hcs) = setup();
        hcs.add(30001, Protocol::Http).await.unwrap();
        hcs.add(30001, Protocol::Http).await.unwrap();
        assert_eq!(cloud.calls.count("create_health_check"), 1);
        assert_eq!(cloud.calls.count("update_health_check"), 0);

        let hc = hcs.get(30001).await.unwrap();
        assert_eq!(hc.name, "k8s-be-30001--uid1");
        assert_eq!(hc.request_path, "/");
        assert_eq!(hc.check_interval_sec, 60);
        assert_eq!(hc.unhealthy_threshold, 10);
        assert!(!hc.self_link.is_empty());
    }

    #[tokio::test]
    async fn test_protocol_change_keeps_request_path() {
        let (cloud, hcs) = setup();
        hcs.add(30001, Protocol::Http).await.unwrap();

        let mut edited = hcs.get(30001).await.unwrap();
        edited.request_path = "/custom".to_string();
        cloud.put(edited);

        hcs.add(30001, Protocol::Https).await.unwrap();
        let hc = hcs.get(30001).await.unwrap();
        assert_eq!(hc.kind, "HTTPS");
        assert_eq!(hc.request_path, "/custom");
        assert_eq!(cloud.calls.count("update_health_check"), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let (_cloud, hcs) = setup();
        assert!(hcs.delete(80).await.unwrap_err().is_not_found());
    }
}
