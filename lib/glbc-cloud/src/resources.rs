//! Cloud load-balancing resources, shaped like the compute JSON schema

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-backend traffic distribution policy. All backends behind one
/// instance group must share a mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalancingMode {
    #[default]
    Rate,
    Utilization,
    Connection,
}

impl fmt::Display for BalancingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancingMode::Rate => write!(f, "RATE"),
            BalancingMode::Utilization => write!(f, "UTILIZATION"),
            BalancingMode::Connection => write!(f, "CONNECTION"),
        }
    }
}

/// A single instance group attached to a backend service
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    /// Link to the instance group
    pub group: String,
    pub balancing_mode: BalancingMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rate_per_instance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_utilization: Option<f64>,
}

impl Backend {
    /// Build a backend for the given group, filling in the capacity knob the
    /// balancing mode requires.
    pub fn for_group(group: impl Into<String>, mode: BalancingMode) -> Self {
        let (max_rate_per_instance, max_utilization) = match mode {
            BalancingMode::Rate => (Some(1.0), None),
            BalancingMode::Utilization => (None, Some(0.8)),
            BalancingMode::Connection => (None, None),
        };
        Self {
            group: group.into(),
            balancing_mode: mode,
            max_rate_per_instance,
            max_utilization,
        }
    }
}

/// Backend service: routes traffic for one node port to a set of instance groups
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendService {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(default)]
    pub description: String,
    /// HTTP or HTTPS
    pub protocol: String,
    pub port: i64,
    pub port_name: String,
    #[serde(default)]
    pub health_checks: Vec<String>,
    #[serde(default)]
    pub backends: Vec<Backend>,
}

/// Health of the instances in one group behind a backend service
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendServiceGroupHealth {
    #[serde(default)]
    pub health_status: Vec<HealthStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub instance: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub port: i64,
    /// HEALTHY, UNHEALTHY, ...
    pub health_state: String,
}

/// HTTP(S) health check
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(default)]
    pub description: String,
    /// HTTP or HTTPS
    #[serde(rename = "type")]
    pub kind: String,
    pub port: i64,
    pub request_path: String,
    pub check_interval_sec: i64,
    pub timeout_sec: i64,
    pub healthy_threshold: i64,
    pub unhealthy_threshold: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedPort {
    pub name: String,
    pub port: i64,
}

/// Zonal, unmanaged instance group
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroup {
    pub name: String,
    pub zone: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(default)]
    pub named_ports: Vec<NamedPort>,
    #[serde(default)]
    pub size: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FirewallAllowed {
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
    #[serde(default)]
    pub ports: Vec<String>,
}

/// Ingress firewall rule
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Firewall {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub source_ranges: Vec<String>,
    #[serde(default)]
    pub target_tags: Vec<String>,
    #[serde(default)]
    pub allowed: Vec<FirewallAllowed>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRule {
    pub hosts: Vec<String>,
    pub path_matcher: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathRule {
    pub paths: Vec<String>,
    pub service: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathMatcher {
    pub name: String,
    pub default_service: String,
    #[serde(default)]
    pub path_rules: Vec<PathRule>,
}

/// Url map: host and path based routing to backend services
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlMap {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    pub default_service: String,
    #[serde(default)]
    pub host_rules: Vec<HostRule>,
    #[serde(default)]
    pub path_matchers: Vec<PathMatcher>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetHttpProxy {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    pub url_map: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetHttpsProxy {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    pub url_map: String,
    #[serde(default)]
    pub ssl_certificates: Vec<String>,
}

/// Uploaded certificate. The private key is write-only: the API never returns it.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SslCertificate {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    pub certificate: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_key: String,
}

impl fmt::Debug for SslCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslCertificate")
            .field("name", &self.name)
            .field("self_link", &self.self_link)
            .finish_non_exhaustive()
    }
}

/// Global forwarding rule: IP + port range -> target proxy
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRule {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(rename = "IPProtocol", default)]
    pub ip_protocol: String,
    pub port_range: String,
    pub target: String,
}

/// Reserved global address
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    pub address: String,
    #[serde(default)]
    pub status: String,
}

/// Zonal group of ip:port endpoints
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEndpointGroup {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(default)]
    pub zone: String,
    pub network_endpoint_type: String,
    pub network: String,
    #[serde(default)]
    pub subnetwork: String,
    #[serde(default)]
    pub size: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEndpoint {
    pub ip_address: String,
    pub instance: String,
    pub port: i64,
}

/// Last segment of a resource link, e.g. the name in `.../backendServices/<name>`.
pub fn resource_name(link: &str) -> &str {
    link.rsplit('/').next().unwrap_or(link)
}

/// True if both links are set and equal.
pub fn compare_links(l1: &str, l2: &str) -> bool {
    !l1.is_empty() && l1 == l2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_name() {
        assert_eq!(
            resource_name("https://www.googleapis.com/compute/v1/projects/p/global/backendServices/k8s-be-80"),
            "k8s-be-80"
        );
        assert_eq!(resource_name("k8s-be-80"), "k8s-be-80");
        assert_eq!(resource_name(""), "");
    }

    #[test]
    fn test_compare_links() {
        assert!(compare_links("a/b", "a/b"));
        assert!(!compare_links("", ""));
        assert!(!compare_links("a/b", "a/c"));
    }

    #[test]
    fn test_backend_capacity_follows_mode() {
        let rate = Backend::for_group("ig", BalancingMode::Rate);
        assert_eq!(rate.max_rate_per_instance, Some(1.0));
        assert_eq!(rate.max_utilization, None);

        let util = Backend::for_group("ig", BalancingMode::Utilization);
        assert_eq!(util.max_utilization, Some(0.8));
        assert_eq!(util.max_rate_per_instance, None);
    }

    #[test]
    fn test_forwarding_rule_wire_names() {
        let fr = ForwardingRule {
            name: "k8s-fw-default-foo".to_string(),
            ip_address: "1.2.3.4".to_string(),
            port_range: "80-80".to_string(),
            target: "tp".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&fr).unwrap();
        assert_eq!(json["IPAddress"], "1.2.3.4");
        assert_eq!(json["portRange"], "80-80");
    }
}
