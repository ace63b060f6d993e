//! Capability sets the reconciliation engine consumes from the cloud.
//!
//! Each pool depends on the narrowest trait it needs, so tests can swap in
//! the fakes without touching reconciliation logic.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::resources::*;

/// Backend services and their aggregated health
#[async_trait]
pub trait BackendServices: Send + Sync {
    async fn get_backend_service(&self, name: &str) -> Result<BackendService>;
    async fn create_backend_service(&self, backend: &BackendService) -> Result<()>;
    async fn update_backend_service(&self, backend: &BackendService) -> Result<()>;
    async fn delete_backend_service(&self, name: &str) -> Result<()>;
    async fn list_backend_services(&self) -> Result<Vec<BackendService>>;
    /// Health of the instances of one group behind the named backend.
    async fn get_health(&self, name: &str, group_link: &str) -> Result<BackendServiceGroupHealth>;
}

#[async_trait]
pub trait HealthChecks: Send + Sync {
    async fn get_health_check(&self, name: &str) -> Result<HealthCheck>;
    async fn create_health_check(&self, hc: &HealthCheck) -> Result<()>;
    async fn update_health_check(&self, hc: &HealthCheck) -> Result<()>;
    async fn delete_health_check(&self, name: &str) -> Result<()>;
}

/// Zonal unmanaged instance groups
#[async_trait]
pub trait InstanceGroups: Send + Sync {
    async fn get_instance_group(&self, name: &str, zone: &str) -> Result<InstanceGroup>;
    async fn create_instance_group(&self, name: &str, zone: &str) -> Result<InstanceGroup>;
    async fn delete_instance_group(&self, name: &str, zone: &str) -> Result<()>;
    /// Links of every instance in the group.
    async fn list_instances_in_instance_group(&self, name: &str, zone: &str) -> Result<Vec<String>>;
    async fn add_instances_to_instance_group(&self, name: &str, zone: &str, instances: &[String]) -> Result<()>;
    async fn remove_instances_from_instance_group(&self, name: &str, zone: &str, instances: &[String]) -> Result<()>;
    /// Replaces the named ports of the group.
    async fn set_named_ports_of_instance_group(&self, name: &str, zone: &str, ports: &[NamedPort]) -> Result<()>;
}

#[async_trait]
pub trait Firewalls: Send + Sync {
    async fn get_firewall(&self, name: &str) -> Result<Firewall>;
    async fn create_firewall(&self, firewall: &Firewall) -> Result<()>;
    async fn update_firewall(&self, firewall: &Firewall) -> Result<()>;
    async fn delete_firewall(&self, name: &str) -> Result<()>;
    /// Network tags carried by the instances backing the given nodes.
    async fn get_node_tags(&self, node_names: &[String]) -> Result<Vec<String>>;
    fn network_url(&self) -> String;
}

/// Everything an L7 is built from: url maps, target proxies, certificates,
/// global forwarding rules and global addresses.
#[async_trait]
pub trait LoadBalancers: Send + Sync {
    async fn get_url_map(&self, name: &str) -> Result<UrlMap>;
    async fn create_url_map(&self, url_map: &UrlMap) -> Result<UrlMap>;
    async fn update_url_map(&self, url_map: &UrlMap) -> Result<UrlMap>;
    async fn delete_url_map(&self, name: &str) -> Result<()>;
    async fn list_url_maps(&self) -> Result<Vec<UrlMap>>;

    async fn get_target_http_proxy(&self, name: &str) -> Result<TargetHttpProxy>;
    async fn create_target_http_proxy(&self, proxy: &TargetHttpProxy) -> Result<TargetHttpProxy>;
    async fn set_url_map_for_target_http_proxy(&self, proxy: &str, url_map_link: &str) -> Result<()>;
    async fn delete_target_http_proxy(&self, name: &str) -> Result<()>;

    async fn get_target_https_proxy(&self, name: &str) -> Result<TargetHttpsProxy>;
    async fn create_target_https_proxy(&self, proxy: &TargetHttpsProxy) -> Result<TargetHttpsProxy>;
    async fn set_url_map_for_target_https_proxy(&self, proxy: &str, url_map_link: &str) -> Result<()>;
    async fn set_ssl_certificate_for_target_https_proxy(&self, proxy: &str, cert_link: &str) -> Result<()>;
    async fn delete_target_https_proxy(&self, name: &str) -> Result<()>;

    async fn get_ssl_certificate(&self, name: &str) -> Result<SslCertificate>;
    async fn create_ssl_certificate(&self, cert: &SslCertificate) -> Result<SslCertificate>;
    async fn delete_ssl_certificate(&self, name: &str) -> Result<()>;

    async fn get_global_forwarding_rule(&self, name: &str) -> Result<ForwardingRule>;
    /// Creates the rule; an empty `ip_address` requests an ephemeral IP.
    async fn create_global_forwarding_rule(&self, rule: &ForwardingRule) -> Result<ForwardingRule>;
    async fn set_proxy_for_global_forwarding_rule(&self, name: &str, target_link: &str) -> Result<()>;
    async fn delete_global_forwarding_rule(&self, name: &str) -> Result<()>;

    async fn get_global_address(&self, name: &str) -> Result<Address>;
    async fn reserve_global_address(&self, address: &Address) -> Result<Address>;
    async fn delete_global_address(&self, name: &str) -> Result<()>;
}

#[async_trait]
pub trait NetworkEndpointGroupCloud: Send + Sync {
    /// Every NEG in the project, keyed by zone.
    async fn aggregated_list_network_endpoint_groups(&self) -> Result<BTreeMap<String, Vec<NetworkEndpointGroup>>>;
    async fn get_network_endpoint_group(&self, name: &str, zone: &str) -> Result<NetworkEndpointGroup>;
    async fn create_network_endpoint_group(&self, neg: &NetworkEndpointGroup, zone: &str) -> Result<()>;
    async fn delete_network_endpoint_group(&self, name: &str, zone: &str) -> Result<()>;
    async fn attach_network_endpoints(&self, name: &str, zone: &str, endpoints: &[NetworkEndpoint]) -> Result<()>;
    async fn detach_network_endpoints(&self, name: &str, zone: &str, endpoints: &[NetworkEndpoint]) -> Result<()>;
    async fn list_network_endpoints(&self, name: &str, zone: &str) -> Result<Vec<NetworkEndpoint>>;
    fn network_url(&self) -> String;
    fn subnetwork_url(&self) -> String;
}

/// Zones the cluster spans, and which zone a node lives in
#[async_trait]
pub trait ZoneLister: Send + Sync {
    async fn list_zones(&self) -> Result<Vec<String>>;
    async fn get_zone_for_node(&self, node_name: &str) -> Result<String>;
}
