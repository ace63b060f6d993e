//! Fake L7 resources: url maps, proxies, certificates, forwarding rules and
//! addresses. Deleting a resource that another one still references fails
//! with an in-use error, like the real API.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{global_link, lock, CallLog, Faults};
use crate::error::{CloudError, Result};
use crate::interfaces::LoadBalancers;
use crate::resources::*;

#[derive(Default, Debug)]
struct State {
    url_maps: BTreeMap<String, UrlMap>,
    http_proxies: BTreeMap<String, TargetHttpProxy>,
    https_proxies: BTreeMap<String, TargetHttpsProxy>,
    certs: BTreeMap<String, SslCertificate>,
    forwarding_rules: BTreeMap<String, ForwardingRule>,
    addresses: BTreeMap<String, Address>,
    next_ip: u32,
}

impl State {
    fn ephemeral_ip(&mut self) -> String {
        self.next_ip += 1;
        format!("35.0.{}.{}", self.next_ip / 256, self.next_ip % 256)
    }
}

#[derive(Default, Debug)]
pub struct FakeLoadBalancers {
    state: Mutex<State>,
    pub calls: CallLog,
    pub faults: Faults,
}

fn not_found(kind: &str, name: &str) -> CloudError {
    CloudError::not_found(format!("{} {}", kind, name))
}

fn exists(kind: &str, name: &str) -> CloudError {
    CloudError::conflict(format!("{} {} already exists", kind, name))
}

impl FakeLoadBalancers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an address out of band, e.g. a user-managed static IP.
    pub fn put_address(&self, name: &str, ip: &str) {
        lock(&self.state).addresses.insert(
            name.to_string(),
            Address {
                name: name.to_string(),
                self_link: global_link("addresses", name),
                address: ip.to_string(),
                status: "RESERVED".to_string(),
            },
        );
    }

    /// Overwrite a forwarding rule without recording a call.
    pub fn put_forwarding_rule(&self, rule: ForwardingRule) {
        lock(&self.state)
            .forwarding_rules
            .insert(rule.name.clone(), rule);
    }

    /// Upload a certificate out of band, e.g. a pre-shared certificate.
    pub fn put_ssl_certificate(&self, name: &str, certificate: &str) {
        lock(&self.state).certs.insert(
            name.to_string(),
            SslCertificate {
                name: name.to_string(),
                self_link: global_link("sslCertificates", name),
                certificate: certificate.to_string(),
                private_key: String::new(),
            },
        );
    }

    pub fn url_map_names(&self) -> Vec<String> {
        lock(&self.state).url_maps.keys().cloned().collect()
    }

    pub fn ssl_certificate_names(&self) -> Vec<String> {
        lock(&self.state).certs.keys().cloned().collect()
    }

    pub fn forwarding_rule_names(&self) -> Vec<String> {
        lock(&self.state).forwarding_rules.keys().cloned().collect()
    }

    pub fn address_names(&self) -> Vec<String> {
        lock(&self.state).addresses.keys().cloned().collect()
    }

    /// Count of every stored resource, handy to assert nothing leaked.
    pub fn resource_count(&self) -> usize {
        let state = lock(&self.state);
        state.url_maps.len()
            + state.http_proxies.len()
            + state.https_proxies.len()
            + state.certs.len()
            + state.forwarding_rules.len()
            + state.addresses.len()
    }
}

#[async_trait]
impl LoadBalancers for FakeLoadBalancers {
    async fn get_url_map(&self, name: &str) -> Result<UrlMap> {
        self.faults.check("get_url_map")?;
        lock(&self.state)
            .url_maps
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("url map", name))
    }

    async fn create_url_map(&self, url_map: &UrlMap) -> Result<UrlMap> {
        self.calls.record("create_url_map", &url_map.name);
        self.faults.check("create_url_map")?;
        let mut state = lock(&self.state);
        if state.url_maps.contains_key(&url_map.name) {
            return Err(exists("url map", &url_map.name));
        }
        let mut created = url_map.clone();
        created.self_link = global_link("urlMaps", &url_map.name);
        state.url_maps.insert(url_map.name.clone(), created.clone());
        Ok(created)
    }

    async fn update_url_map(&self, url_map: &UrlMap) -> Result<UrlMap> {
        self.calls.record("update_url_map", &url_map.name);
        self.faults.check("update_url_map")?;
        let mut state = lock(&self.state);
        let existing = state
            .url_maps
            .get_mut(&url_map.name)
            .ok_or_else(|| not_found("url map", &url_map.name))?;
        let self_link = existing.self_link.clone();
        *existing = url_map.clone();
        existing.self_link = self_link;
        Ok(existing.clone())
    }

    async fn delete_url_map(&self, name: &str) -> Result<()> {
        self.calls.record("delete_url_map", name);
        self.faults.check("delete_url_map")?;
        let mut state = lock(&self.state);
        let link = global_link("urlMaps", name);
        let referenced = state.http_proxies.values().any(|p| p.url_map == link)
            || state.https_proxies.values().any(|p| p.url_map == link);
        if referenced {
            return Err(CloudError::in_use(format!("url map {}", name)));
        }
        state
            .url_maps
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("url map", name))
    }

    async fn list_url_maps(&self) -> Result<Vec<UrlMap>> {
        self.faults.check("list_url_maps")?;
        Ok(lock(&self.state).url_maps.values().cloned().collect())
    }

    async fn get_target_http_proxy(&self, name: &str) -> Result<TargetHttpProxy> {
        self.faults.check("get_target_http_proxy")?;
        lock(&self.state)
            .http_proxies
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("target http proxy", name))
    }

    async fn create_target_http_proxy(&self, proxy: &TargetHttpProxy) -> Result<TargetHttpProxy> {
        self.calls.record("create_target_http_proxy", &proxy.name);
        self.faults.check("create_target_http_proxy")?;
        let mut state = lock(&self.state);
        if state.http_proxies.contains_key(&proxy.name) {
            return Err(exists("target http proxy", &proxy.name));
        }
        let mut created = proxy.clone();
        created.self_link = global_link("targetHttpProxies", &proxy.name);
        state.http_proxies.insert(proxy.name.clone(), created.clone());
        Ok(created)
    }

    async fn set_url_map_for_target_http_proxy(&self, proxy: &str, url_map_link: &str) -> Result<()> {
        self.calls.record("set_url_map_for_target_http_proxy", proxy);
        self.faults.check("set_url_map_for_target_http_proxy")?;
        let mut state = lock(&self.state);
        let existing = state
            .http_proxies
            .get_mut(proxy)
            .ok_or_else(|| not_found("target http proxy", proxy))?;
        existing.url_map = url_map_link.to_string();
        Ok(())
    }

    async fn delete_target_http_proxy(&self, name: &str) -> Result<()> {
        self.calls.record("delete_target_http_proxy", name);
        self.faults.check("delete_target_http_proxy")?;
        let mut state = lock(&self.state);
        let link = global_link("targetHttpProxies", name);
        if state.forwarding_rules.values().any(|r| r.target == link) {
            return Err(CloudError::in_use(format!("target http proxy {}", name)));
        }
        state
            .http_proxies
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("target http proxy", name))
    }

    async fn get_target_https_proxy(&self, name: &str) -> Result<TargetHttpsProxy> {
        self.faults.check("get_target_https_proxy")?;
        lock(&self.state)
            .https_proxies
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("target https proxy", name))
    }

    async fn create_target_https_proxy(&self, proxy: &TargetHttpsProxy) -> Result<TargetHttpsProxy> {
        self.calls.record("create_target_https_proxy", &proxy.name);
        self.faults.check("create_target_https_proxy")?;
        let mut state = lock(&self.state);
        if state.https_proxies.contains_key(&proxy.name) {
            return Err(exists("target https proxy", &proxy.name));
        }
        let mut created = proxy.clone();
        created.self_link = global_link("targetHttpsProxies", &proxy.name);
        state.https_proxies.insert(proxy.name.clone(), created.clone());
        Ok(created)
    }

    async fn set_url_map_for_target_https_proxy(&self, proxy: &str, url_map_link: &str) -> Result<()> {
        self.calls.record("set_url_map_for_target_https_proxy", proxy);
        self.faults.check("set_url_map_for_target_https_proxy")?;
        let mut state = lock(&self.state);
        let existing = state
            .https_proxies
            .get_mut(proxy)
            .ok_or_else(|| not_found("target https proxy", proxy))?;
        existing.url_map = url_map_link.to_string();
        Ok(())
    }

    async fn set_ssl_certificate_for_target_https_proxy(&self, proxy: &str, cert_link: &str) -> Result<()> {
        self.calls
            .record("set_ssl_certificate_for_target_https_proxy", proxy);
        self.faults.check("set_ssl_certificate_for_target_https_proxy")?;
        let mut state = lock(&self.state);
        let existing = state
            .https_proxies
            .get_mut(proxy)
            .ok_or_else(|| not_found("target https proxy", proxy))?;
        existing.ssl_certificates = vec![cert_link.to_string()];
        Ok(())
    }

    async fn delete_target_https_proxy(&self, name: &str) -> Result<()> {
        self.calls.record("delete_target_https_proxy", name);
        self.faults.check("delete_target_https_proxy")?;
        let mut state = lock(&self.state);
        let link = global_link("targetHttpsProxies", name);
        if state.forwarding_rules.values().any(|r| r.target == link) {
            return Err(CloudError::in_use(format!("target https proxy {}", name)));
        }
        state
            .https_proxies
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("target https proxy", name))
    }

    async fn get_ssl_certificate(&self, name: &str) -> Result<SslCertificate> {
        self.faults.check("get_ssl_certificate")?;
        lock(&self.state)
            .certs
            .get(name)
            .map(|c| SslCertificate {
                private_key: String::new(),
                ..c.clone()
            })
            .ok_or_else(|| not_found("ssl certificate", name))
    }

    async fn create_ssl_certificate(&self, cert: &SslCertificate) -> Result<SslCertificate> {
        self.calls.record("create_ssl_certificate", &cert.name);
        self.faults.check("create_ssl_certificate")?;
        let mut state = lock(&self.state);
        if state.certs.contains_key(&cert.name) {
            return Err(exists("ssl certificate", &cert.name));
        }
        let mut created = cert.clone();
        created.self_link = global_link("sslCertificates", &cert.name);
        state.certs.insert(cert.name.clone(), created.clone());
        created.private_key = String::new();
        Ok(created)
    }

    async fn delete_ssl_certificate(&self, name: &str) -> Result<()> {
        self.calls.record("delete_ssl_certificate", name);
        self.faults.check("delete_ssl_certificate")?;
        let mut state = lock(&self.state);
        let link = global_link("sslCertificates", name);
        if state
            .https_proxies
            .values()
            .any(|p| p.ssl_certificates.contains(&link))
        {
            return Err(CloudError::in_use(format!("ssl certificate {}", name)));
        }
        state
            .certs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("ssl certificate", name))
    }

    async fn get_global_forwarding_rule(&self, name: &str) -> Result<ForwardingRule> {
        self.faults.check("get_global_forwarding_rule")?;
        lock(&self.state)
            .forwarding_rules
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("forwarding rule", name))
    }

    async fn create_global_forwarding_rule(&self, rule: &ForwardingRule) -> Result<ForwardingRule> {
        self.calls.record("create_global_forwarding_rule", &rule.name);
        self.faults.check("create_global_forwarding_rule")?;
        let mut state = lock(&self.state);
        if state.forwarding_rules.contains_key(&rule.name) {
            return Err(exists("forwarding rule", &rule.name));
        }
        let mut created = rule.clone();
        created.self_link = global_link("forwardingRules", &rule.name);
        if created.ip_address.is_empty() {
            created.ip_address = state.ephemeral_ip();
        }
        state
            .forwarding_rules
            .insert(rule.name.clone(), created.clone());
        Ok(created)
    }

    async fn set_proxy_for_global_forwarding_rule(&self, name: &str, target_link: &str) -> Result<()> {
        self.calls.record("set_proxy_for_global_forwarding_rule", name);
        self.faults.check("set_proxy_for_global_forwarding_rule")?;
        let mut state = lock(&self.state);
        let existing = state
            .forwarding_rules
            .get_mut(name)
            .ok_or_else(|| not_found("forwarding rule", name))?;
        existing.target = target_link.to_string();
        Ok(())
    }

    async fn delete_global_forwarding_rule(&self, name: &str) -> Result<()> {
        self.calls.record("delete_global_forwarding_rule", name);
        self.faults.check("delete_global_forwarding_rule")?;
        lock(&self.state)
            .forwarding_rules
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("forwarding rule", name))
    }

    async fn get_global_address(&self, name: &str) -> Result<Address> {
        self.faults.check("get_global_address")?;
        lock(&self.state)
            .addresses
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("address", name))
    }

    async fn reserve_global_address(&self, address: &Address) -> Result<Address> {
        self.calls.record("reserve_global_address", &address.name);
        self.faults.check("reserve_global_address")?;
        let mut state = lock(&self.state);
        if state.addresses.contains_key(&address.name) {
            return Err(exists("address", &address.name));
        }
        if state
            .addresses
            .values()
            .any(|a| a.address == address.address)
        {
            return Err(CloudError::bad_request(format!(
                "address {} is already reserved",
                address.address
            )));
        }
        let mut created = address.clone();
        created.self_link = global_link("addresses", &address.name);
        if created.address.is_empty() {
            created.address = state.ephemeral_ip();
        }
        created.status = "RESERVED".to_string();
        state.addresses.insert(address.name.clone(), created.clone());
        Ok(created)
    }

    async fn delete_global_address(&self, name: &str) -> Result<()> {
        self.calls.record("delete_global_address", name);
        self.faults.check("delete_global_address")?;
        lock(&self.state)
            .addresses
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("address", name))
    }
}
