//! Network endpoint groups
//!
//! In NEG mode pod IPs are attached to zonal endpoint groups directly,
//! bypassing instance groups. One background syncer per service target port
//! keeps the groups in line with the service endpoints.

mod manager;
mod syncer;

pub use manager::SyncerManager;
pub use syncer::{RetryBackoff, Syncer};

use async_trait::async_trait;
use glbc_cloud::NetworkEndpoint;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{Error, Result};

/// Endpoint type of every NEG the controller creates.
pub const NEG_ENDPOINT_TYPE: &str = "GCE_VM_IP_PORT";

/// Upper bound on endpoints per attach or detach call.
pub const MAX_NETWORK_ENDPOINTS_PER_BATCH: usize = 500;

const ENDPOINT_SEPARATOR: &str = "||";

/// A service and one of its target ports. Each one gets its own NEG.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NegServicePort {
    pub namespace: String,
    pub name: String,
    /// Container port, by number or by name
    pub target_port: String,
}

impl NegServicePort {
    pub fn new(namespace: &str, name: &str, target_port: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            target_port: target_port.to_string(),
        }
    }
}

impl fmt::Display for NegServicePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}-{}", self.namespace, self.name, self.target_port)
    }
}

/// Ready endpoints of a service, grouped the way the cluster reports them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSubset {
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAddress {
    pub ip: String,
    #[serde(default)]
    pub node_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointPort {
    #[serde(default)]
    pub name: String,
    pub port: i64,
}

/// Source of service endpoints, e.g. an informer cache.
#[async_trait]
pub trait EndpointsGetter: Send + Sync {
    /// None if the service has no endpoints object (yet).
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>>;
}

/// zone -> encoded endpoints
pub type ZoneEndpointMap = BTreeMap<String, BTreeSet<String>>;

pub fn encode_endpoint(ip: &str, instance: &str, port: &str) -> String {
    [ip, instance, port].join(ENDPOINT_SEPARATOR)
}

pub fn decode_endpoint(encoded: &str) -> Result<NetworkEndpoint> {
    let parts: Vec<&str> = encoded.split(ENDPOINT_SEPARATOR).collect();
    let [ip, instance, port] = parts.as_slice() else {
        return Err(Error::Syncer(format!("malformed endpoint {:?}", encoded)));
    };
    let port = port
        .parse::<i64>()
        .map_err(|e| Error::Syncer(format!("failed to decode endpoint {:?}: {}", encoded, e)))?;
    Ok(NetworkEndpoint {
        ip_address: ip.to_string(),
        instance: instance.to_string(),
        port,
    })
}

/// The port number endpoints of `subset` serve `target_port` on, if any.
/// A numeric target port matches by number, anything else by port name.
pub fn match_target_port(subset: &EndpointSubset, target_port: &str) -> Option<String> {
    match target_port.parse::<i64>() {
        Ok(number) if number != 0 => subset
            .ports
            .iter()
            .any(|p| p.port == number)
            .then(|| target_port.to_string()),
        _ => subset
            .ports
            .iter()
            .find(|p| p.name == target_port)
            .map(|p| p.port.to_string()),
    }
}

/// Endpoints to attach and to detach, per zone, to move `current` to
/// `target`. Zones without changes are left out.
pub fn calculate_difference(
    target: &ZoneEndpointMap,
    current: &ZoneEndpointMap,
) -> (ZoneEndpointMap, ZoneEndpointMap) {
    let empty = BTreeSet::new();
    let diff = |from: &ZoneEndpointMap, to: &ZoneEndpointMap| -> ZoneEndpointMap {
        from.iter()
            .filter_map(|(zone, endpoints)| {
                let other = to.get(zone).unwrap_or(&empty);
                let missing: BTreeSet<String> = endpoints.difference(other).cloned().collect();
                (!missing.is_empty()).then(|| (zone.clone(), missing))
            })
            .collect()
    };
    (diff(target, current), diff(current, target))
}

/// Split encoded endpoints into decoded batches of at most `batch_size`.
pub fn endpoint_batches(endpoints: &BTreeSet<String>, batch_size: usize) -> Result<Vec<Vec<NetworkEndpoint>>> {
    let encoded: Vec<&String> = endpoints.iter().collect();
    encoded
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.iter().map(|e| decode_endpoint(e)).collect())
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Endpoints getter over a plain map.
    #[derive(Default)]
    pub(crate) struct FakeEndpoints {
        endpoints: Mutex<HashMap<(String, String), Endpoints>>,
    }

    impl FakeEndpoints {
        pub(crate) fn put(&self, eps: Endpoints) {
            self.endpoints
                .lock()
                .unwrap()
                .insert((eps.namespace.clone(), eps.name.clone()), eps);
        }
    }

    #[async_trait]
    impl EndpointsGetter for FakeEndpoints {
        async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
            Ok(self
                .endpoints
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }
    }

    /// One subset serving `port_name`/`port` on the given (ip, node) pairs.
    pub(crate) fn endpoints(
        namespace: &str,
        name: &str,
        addresses: &[(&str, &str)],
        port_name: &str,
        port: i64,
    ) -> Endpoints {
        Endpoints {
            namespace: namespace.to_string(),
            name: name.to_string(),
            subsets: vec![EndpointSubset {
                addresses: addresses
                    .iter()
                    .map(|(ip, node)| EndpointAddress {
                        ip: ip.to_string(),
                        node_name: Some(node.to_string()),
                    })
                    .collect(),
                ports: vec![EndpointPort {
                    name: port_name.to_string(),
                    port,
                }],
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone_map(entries: &[(&str, &[&str])]) -> ZoneEndpointMap {
        entries
            .iter()
            .map(|(zone, eps)| (zone.to_string(), eps.iter().map(|e| e.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_encode_decode() {
        let encoded = encode_endpoint("10.0.0.1", "node-1", "8080");
        assert_eq!(encoded, "10.0.0.1||node-1||8080");
        let ep = decode_endpoint(&encoded).unwrap();
        assert_eq!(ep.ip_address, "10.0.0.1");
        assert_eq!(ep.instance, "node-1");
        assert_eq!(ep.port, 8080);

        assert!(decode_endpoint("10.0.0.1||node-1").is_err());
        assert!(decode_endpoint("10.0.0.1||node-1||http").is_err());
    }

    #[test]
    fn test_calculate_difference() {
        let target = zone_map(&[("zone1", &["a", "b"]), ("zone2", &["c"])]);
        let current = zone_map(&[("zone1", &["b", "x"]), ("zone3", &["y"])]);
        let (add, remove) = calculate_difference(&target, &current);
        assert_eq!(add, zone_map(&[("zone1", &["a"]), ("zone2", &["c"])]));
        assert_eq!(remove, zone_map(&[("zone1", &["x"]), ("zone3", &["y"])]));

        let (add, remove) = calculate_difference(&target, &target);
        assert!(add.is_empty());
        assert!(remove.is_empty());
    }

    #[test]
    fn test_endpoint_batches() {
        let endpoints: BTreeSet<String> = (0..1201)
            .map(|i| encode_endpoint(&format!("10.0.{}.{}", i / 256, i % 256), "n1", "80"))
            .collect();
        let batches = endpoint_batches(&endpoints, MAX_NETWORK_ENDPOINTS_PER_BATCH).unwrap();
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![500, 500, 201]);
        assert!(endpoint_batches(&BTreeSet::new(), 500).unwrap().is_empty());
    }

    #[test]
    fn test_match_target_port() {
        let subset = EndpointSubset {
            addresses: vec![],
            ports: vec![
                EndpointPort {
                    name: "http".to_string(),
                    port: 8080,
                },
                EndpointPort {
                    name: "metrics".to_string(),
                    port: 9090,
                },
            ],
        };
        assert_eq!(match_target_port(&subset, "9090"), Some("9090".to_string()));
        assert_eq!(match_target_port(&subset, "http"), Some("8080".to_string()));
        assert_eq!(match_target_port(&subset, "80"), None);
        assert_eq!(match_target_port(&subset, "grpc"), None);
    }

    #[test]
    fn test_endpoints_from_json() {
        let json = r#"{
            "namespace": "default",
            "name": "web",
            "subsets": [{
                "addresses": [{"ip": "10.0.0.1", "nodeName": "n1"}],
                "ports": [{"name": "http", "port": 8080}]
            }]
        }"#;
        let eps: Endpoints = serde_json::from_str(json).unwrap();
        assert_eq!(eps.subsets[0].addresses[0].node_name.as_deref(), Some("n1"));
        assert_eq!(
            NegServicePort::new("default", "web", "http").to_string(),
            "default/web-http"
        );
    }
}
