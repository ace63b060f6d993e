//! Fake backend services and health checks

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use super::{global_link, lock, CallLog, Faults};
use crate::error::{CloudError, Result};
use crate::interfaces::{BackendServices, HealthChecks};
use crate::resources::*;

#[derive(Default, Debug)]
pub struct FakeBackendServices {
    backends: Mutex<BTreeMap<String, BackendService>>,
    health: Mutex<BTreeMap<String, String>>,
    rejected_modes: Mutex<HashSet<BalancingMode>>,
    pub calls: CallLog,
    pub faults: Faults,
}

impl FakeBackendServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject creates and updates carrying a backend with the given balancing
    /// mode with a 400, the way the API does when a sibling backend on the
    /// same instance group already uses another mode.
    pub fn reject_balancing_mode(&self, mode: BalancingMode) {
        lock(&self.rejected_modes).insert(mode);
    }

    /// Overwrite a stored backend without recording a call, as an actor
    /// outside the controller would.
    pub fn put(&self, backend: BackendService) {
        let mut backend = backend;
        if backend.self_link.is_empty() {
            backend.self_link = global_link("backendServices", &backend.name);
        }
        lock(&self.backends).insert(backend.name.clone(), backend);
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.backends).keys().cloned().collect()
    }

    pub fn set_health(&self, name: &str, state: &str) {
        lock(&self.health).insert(name.to_string(), state.to_string());
    }

    fn check_modes(&self, backend: &BackendService) -> Result<()> {
        let rejected = lock(&self.rejected_modes);
        match backend.backends.iter().find(|b| rejected.contains(&b.balancing_mode)) {
            Some(b) => Err(CloudError::bad_request(format!(
                "balancing mode {} conflicts with another backend on {}",
                b.balancing_mode, b.group
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BackendServices for FakeBackendServices {
    async fn get_backend_service(&self, name: &str) -> Result<BackendService> {
        self.faults.check("get_backend_service")?;
        lock(&self.backends)
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("backend service {}", name)))
    }

    async fn create_backend_service(&self, backend: &BackendService) -> Result<()> {
        self.calls.record("create_backend_service", &backend.name);
        self.faults.check("create_backend_service")?;
        self.check_modes(backend)?;
        let mut backends = lock(&self.backends);
        if backends.contains_key(&backend.name) {
            return Err(CloudError::conflict(format!("backend service {} exists", backend.name)));
        }
        let mut created = backend.clone();
        created.self_link = global_link("backendServices", &backend.name);
        backends.insert(backend.name.clone(), created);
        Ok(())
    }

    async fn update_backend_service(&self, backend: &BackendService) -> Result<()> {
        self.calls.record("update_backend_service", &backend.name);
        self.faults.check("update_backend_service")?;
        self.check_modes(backend)?;
        let mut backends = lock(&self.backends);
        match backends.get_mut(&backend.name) {
            Some(existing) => {
                let self_link = existing.self_link.clone();
                *existing = backend.clone();
                existing.self_link = self_link;
                Ok(())
            }
            None => Err(CloudError::not_found(format!("backend service {}", backend.name))),
        }
    }

    async fn delete_backend_service(&self, name: &str) -> Result<()> {
        self.calls.record("delete_backend_service", name);
        self.faults.check("delete_backend_service")?;
        lock(&self.backends)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found(format!("backend service {}", name)))
    }

    async fn list_backend_services(&self) -> Result<Vec<BackendService>> {
        self.faults.check("list_backend_services")?;
        Ok(lock(&self.backends).values().cloned().collect())
    }

    async fn get_health(&self, name: &str, group_link: &str) -> Result<BackendServiceGroupHealth> {
        self.faults.check("get_health")?;
        if !lock(&self.backends).contains_key(name) {
            return Err(CloudError::not_found(format!("backend service {}", name)));
        }
        let state = lock(&self.health)
            .get(name)
            .cloned()
            .unwrap_or_else(|| "HEALTHY".to_string());
        Ok(BackendServiceGroupHealth {
            health_status: vec![HealthStatus {
                instance: format!("{}/instances/0", group_link),
                health_state: state,
                ..Default::default()
            }],
        })
    }
}

#[derive(Default, Debug)]
pub struct FakeHealthChecks {
    checks: Mutex<BTreeMap<String, HealthCheck>>,
    pub calls: CallLog,
    pub faults: Faults,
}

impl FakeHealthChecks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, hc: HealthCheck) {
        let mut hc = hc;
        hc.self_link = global_link("healthChecks", &hc.name);
        lock(&self.checks).insert(hc.name.clone(), hc);
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.checks).keys().cloned().collect()
    }
}

#[async_trait]
impl HealthChecks for FakeHealthChecks {
    async fn get_health_check(&self, name: &str) -> Result<HealthCheck> {
        self.faults.check("get_health_check")?;
        lock(&self.checks)
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("health check {}", name)))
    }

    async fn create_health_check(&self, hc: &HealthCheck) -> Result<()> {
        self.calls.record("create_health_check", &hc.name);
        self.faults.check("create_health_check")?;
        let mut checks = lock(&self.checks);
        if checks.contains_key(&hc.name) {
            return Err(CloudError::conflict(format!("health check {} exists", hc.name)));
        }
        let mut created = hc.clone();
        created.self_link = global_link("healthChecks", &hc.name);
        checks.insert(hc.name.clone(), created);
        Ok(())
    }

    async fn update_health_check(&self, hc: &HealthCheck) -> Result<()> {
        self.calls.record("update_health_check", &hc.name);
        self.faults.check("update_health_check")?;
        let mut checks = lock(&self.checks);
        match checks.get_mut(&hc.name) {
            Some(existing) => {
                let self_link = existing.self_link.clone();
                *existing = hc.clone();
                existing.self_link = self_link;
                Ok(())
            }
            None => Err(CloudError::not_found(format!("health check {}", hc.name))),
        }
    }

    async fn delete_health_check(&self, name: &str) -> Result<()> {
        self.calls.record("delete_health_check", name);
        self.faults.check("delete_health_check")?;
        lock(&self.checks)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found(format!("health check {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejected_mode_only_fails_that_mode() {
        let cloud = FakeBackendServices::new();
        cloud.reject_balancing_mode(BalancingMode::Rate);

        let mut be = BackendService {
            name: "k8s-be-80".to_string(),
            protocol: "HTTP".to_string(),
            port: 80,
            port_name: "port80".to_string(),
            backends: vec![Backend::for_group("ig", BalancingMode::Rate)],
            ..Default::default()
        };
        let err = cloud.create_backend_service(&be).await.unwrap_err();
        assert!(err.is_bad_request());

        be.backends = vec![Backend::for_group("ig", BalancingMode::Utilization)];
        cloud.create_backend_service(&be).await.unwrap();
        assert_eq!(cloud.calls.count("create_backend_service"), 2);
        assert!(!cloud.get_backend_service("k8s-be-80").await.unwrap().self_link.is_empty());
    }
}
