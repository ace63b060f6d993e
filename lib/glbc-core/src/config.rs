//! Controller configuration loaded from YAML

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::backends::{Protocol, ServicePort};
use crate::error::{Error, Result};
use crate::namer::CLUSTER_NAME_DELIMITER;

/// Source ranges of the L7 health checkers and proxies.
pub const DEFAULT_L7_SOURCE_RANGES: [&str; 2] = ["130.211.0.0/22", "35.191.0.0/16"];

pub const DEFAULT_BACKEND_NODE_PORT: i64 = 30000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Suffix tagging every resource this cluster owns. May be empty.
    pub cluster_uid: String,
    /// Suffix of the firewall rule. Falls back to the cluster uid.
    pub firewall_uid: String,
    /// Node port of the default backend that serves 404s.
    pub default_backend_port: ServicePort,
    pub health_check_path: String,
    pub default_backend_health_check_path: String,
    /// Relist backend services from the cloud so resources left behind by a
    /// previous controller get garbage collected.
    pub resync_with_cloud: bool,
    pub resync_period_secs: u64,
    pub l7_source_ranges: Vec<String>,
    pub neg: NegConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cluster_uid: String::new(),
            firewall_uid: String::new(),
            default_backend_port: ServicePort {
                port: DEFAULT_BACKEND_NODE_PORT,
                protocol: Protocol::Http,
                service_name: "kube-system/default-http-backend".to_string(),
                service_port: "http".to_string(),
            },
            health_check_path: "/".to_string(),
            default_backend_health_check_path: "/healthz".to_string(),
            resync_with_cloud: true,
            resync_period_secs: 30,
            l7_source_ranges: DEFAULT_L7_SOURCE_RANGES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            neg: NegConfig::default(),
        }
    }
}

/// Tuning of the NEG syncers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegConfig {
    /// Failed syncs beyond this count are reported but no longer retried.
    pub max_retries: u32,
    pub min_retry_delay_secs: u64,
    pub max_retry_delay_secs: u64,
    /// Max endpoints per attach/detach call.
    pub batch_size: usize,
}

impl Default for NegConfig {
    fn default() -> Self {
        Self {
            max_retries: 15,
            min_retry_delay_secs: 5,
            max_retry_delay_secs: 300,
            batch_size: 500,
        }
    }
}

impl NegConfig {
    pub fn min_retry_delay(&self) -> Duration {
        Duration::from_secs(self.min_retry_delay_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }
}

impl ControllerConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ControllerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        for uid in [&self.cluster_uid, &self.firewall_uid] {
            if uid.contains(CLUSTER_NAME_DELIMITER) {
                return Err(Error::InvalidConfiguration(format!(
                    "uid {:?} must not contain {:?}",
                    uid, CLUSTER_NAME_DELIMITER
                )));
            }
        }
        for range in &self.l7_source_ranges {
            range.parse::<IpNetwork>().map_err(|e| {
                Error::InvalidConfiguration(format!("invalid source range {}: {}", range, e))
            })?;
        }
        if self.default_backend_port.port <= 0 {
            return Err(Error::InvalidConfiguration(format!(
                "invalid default backend port {}",
                self.default_backend_port.port
            )));
        }
        if self.neg.batch_size == 0 {
            return Err(Error::InvalidConfiguration(
                "neg.batch_size must be positive".to_string(),
            ));
        }
        if self.neg.min_retry_delay_secs > self.neg.max_retry_delay_secs {
            return Err(Error::InvalidConfiguration(format!(
                "neg.min_retry_delay_secs {} exceeds neg.max_retry_delay_secs {}",
                self.neg.min_retry_delay_secs, self.neg.max_retry_delay_secs
            )));
        }
        Ok(())
    }

    /// Firewall uid, defaulting to the cluster uid.
    pub fn effective_firewall_uid(&self) -> &str {
        if self.firewall_uid.is_empty() {
            &self.cluster_uid
        } else {
            &self.firewall_uid
        }
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }

    /// Fresh cluster uid for a cluster that has none yet.
    pub fn generate_uid() -> String {
        uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::from_yaml("{}").unwrap();
        assert_eq!(config.default_backend_port.port, 30000);
        assert_eq!(config.health_check_path, "/");
        assert_eq!(config.default_backend_health_check_path, "/healthz");
        assert_eq!(config.l7_source_ranges, vec!["130.211.0.0/22", "35.191.0.0/16"]);
        assert_eq!(config.neg.batch_size, 500);
        assert_eq!(config.neg.max_retries, 15);
        assert!(config.resync_with_cloud);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
cluster_uid: uid1
default_backend_port:
  port: 31000
  protocol: HTTPS
neg:
  batch_size: 10
"#;
        let config = ControllerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.cluster_uid, "uid1");
        assert_eq!(config.effective_firewall_uid(), "uid1");
        assert_eq!(config.default_backend_port.port, 31000);
        assert_eq!(config.default_backend_port.protocol, Protocol::Https);
        assert_eq!(config.neg.batch_size, 10);
        assert_eq!(config.neg.max_retry_delay_secs, 300);
    }

    #[test]
    fn test_validate() {
        assert!(ControllerConfig::from_yaml("cluster_uid: a--b").is_err());
        assert!(ControllerConfig::from_yaml("l7_source_ranges: [\"not-a-cidr\"]").is_err());
        assert!(ControllerConfig::from_yaml("neg: {batch_size: 0}").is_err());
        assert!(ControllerConfig::from_yaml(
            "neg: {min_retry_delay_secs: 10, max_retry_delay_secs: 5}"
        )
        .is_err());
    }

    #[test]
    fn test_generate_uid() {
        let uid = ControllerConfig::generate_uid();
        assert_eq!(uid.len(), 16);
        assert!(!uid.contains(CLUSTER_NAME_DELIMITER));
        assert_ne!(uid, ControllerConfig::generate_uid());
    }
}
