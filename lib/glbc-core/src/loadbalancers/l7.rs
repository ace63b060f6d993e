use glbc_cloud::{
    compare_links, resource_name, Address, BackendService, ForwardingRule, LoadBalancers,
    SslCertificate, TargetHttpProxy, TargetHttpsProxy, UrlMap,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::url_map::GceUrlMap;
use crate::backends::BackendPool;
use crate::error::{Error, Result};
use crate::namer::Namer;

/// Prefix of the status annotations written back to the Ingress.
pub const ANNOTATION_PREFIX: &str = "ingress.kubernetes.io";

const HTTP_PORT_RANGE: &str = "80-80";
const HTTPS_PORT_RANGE: &str = "443-443";
const TCP: &str = "TCP";

/// Certificate material read from an Ingress TLS secret.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TlsCerts {
    pub key: String,
    pub cert: String,
    pub chain: String,
}

impl fmt::Debug for TlsCerts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCerts")
            .field("cert_len", &self.cert.len())
            .finish_non_exhaustive()
    }
}

/// What the controller wants a single L7 to look like.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct L7RuntimeInfo {
    /// Ingress key, usually namespace/name
    pub name: String,
    /// Plain HTTP on port 80
    pub allow_http: bool,
    /// Uploaded certificate for HTTPS
    pub tls: Option<TlsCerts>,
    /// Name of a certificate already present in the cloud. Takes precedence
    /// over `tls`.
    pub tls_name: String,
    /// Name of a user reserved global address
    pub static_ip_name: String,
}

impl L7RuntimeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allow_http: true,
            ..Default::default()
        }
    }

    pub fn tls_configured(&self) -> bool {
        self.tls.is_some() || !self.tls_name.is_empty()
    }
}

/// One HTTP(S) load balancer: url map, target proxies, forwarding rules,
/// optional certificate and static IP.
#[derive(Clone)]
pub struct L7 {
    name: String,
    runtime_info: L7RuntimeInfo,
    cloud: Arc<dyn LoadBalancers>,
    namer: Arc<Namer>,
    /// Backend the url map falls back to
    glbc_default_backend: Option<BackendService>,
    um: Option<UrlMap>,
    tp: Option<TargetHttpProxy>,
    tps: Option<TargetHttpsProxy>,
    fw: Option<ForwardingRule>,
    fws: Option<ForwardingRule>,
    ip: Option<Address>,
    ssl_cert: Option<SslCertificate>,
    /// Certificate replaced by the last rotation, deleted once the https
    /// proxy no longer points at it.
    old_ssl_cert: Option<SslCertificate>,
}

impl L7 {
    pub fn new(
        name: impl Into<String>,
        runtime_info: L7RuntimeInfo,
        cloud: Arc<dyn LoadBalancers>,
        namer: Arc<Namer>,
    ) -> Self {
        Self {
            name: name.into(),
            runtime_info,
            cloud,
            namer,
            glbc_default_backend: None,
            um: None,
            tp: None,
            tps: None,
            fw: None,
            fws: None,
            ip: None,
            ssl_cert: None,
            old_ssl_cert: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runtime_info(&self) -> &L7RuntimeInfo {
        &self.runtime_info
    }

    pub(crate) fn set_runtime_info(&mut self, runtime_info: L7RuntimeInfo) {
        self.runtime_info = runtime_info;
    }

    pub(crate) fn set_default_backend(&mut self, backend: Option<BackendService>) {
        self.glbc_default_backend = backend;
    }

    pub fn url_map(&self) -> Option<&UrlMap> {
        self.um.as_ref()
    }

    pub fn target_http_proxy(&self) -> Option<&TargetHttpProxy> {
        self.tp.as_ref()
    }

    pub fn target_https_proxy(&self) -> Option<&TargetHttpsProxy> {
        self.tps.as_ref()
    }

    pub fn forwarding_rule(&self) -> Option<&ForwardingRule> {
        self.fw.as_ref()
    }

    pub fn https_forwarding_rule(&self) -> Option<&ForwardingRule> {
        self.fws.as_ref()
    }

    pub fn static_ip(&self) -> Option<&Address> {
        self.ip.as_ref()
    }

    pub fn ssl_certificate(&self) -> Option<&SslCertificate> {
        self.ssl_cert.as_ref()
    }

    /// Walk the resource chain front to back, creating what is missing and
    /// repairing links that drifted.
    pub async fn edge_hop(&mut self) -> Result<()> {
        self.check_url_map().await?;
        if self.runtime_info.allow_http {
            self.edge_hop_http().await?;
        }
        // Only reserve an IP once both rules can share it.
        if self.runtime_info.allow_http && self.runtime_info.tls_configured() {
            self.check_static_ip().await?;
        }
        if self.runtime_info.tls_configured() {
            self.edge_hop_https().await?;
        }
        Ok(())
    }

    async fn edge_hop_http(&mut self) -> Result<()> {
        self.check_proxy().await?;
        self.check_http_forwarding_rule().await
    }

    async fn edge_hop_https(&mut self) -> Result<()> {
        self.check_ssl_cert().await?;
        self.check_https_proxy().await?;
        self.check_https_forwarding_rule().await?;
        self.delete_old_ssl_cert().await
    }

    async fn check_url_map(&mut self) -> Result<()> {
        let default_backend = self.glbc_default_backend.as_ref().ok_or_else(|| {
            Error::MissingPrerequisite(format!(
                "cannot create urlmap for {} without a default backend",
                self.name
            ))
        })?;
        let name = self.namer.url_map_name(&self.name);
        match self.cloud.get_url_map(&name).await {
            Ok(um) => {
                debug!("Url map {} already exists", name);
                self.um = Some(um);
            }
            Err(e) if e.is_not_found() => {
                info!("Creating url map {} for backend {}", name, default_backend.name);
                let um = self
                    .cloud
                    .create_url_map(&UrlMap {
                        name,
                        default_service: default_backend.self_link.clone(),
                        ..Default::default()
                    })
                    .await?;
                self.um = Some(um);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn url_map_link(&self, what: &str) -> Result<String> {
        self.um
            .as_ref()
            .map(|um| um.self_link.clone())
            .ok_or_else(|| {
                Error::MissingPrerequisite(format!("cannot create {} without a url map", what))
            })
    }

    async fn check_proxy(&mut self) -> Result<()> {
        let um_link = self.url_map_link("proxy")?;
        let name = self.namer.target_proxy_name(&self.name);
        let mut proxy = match self.cloud.get_target_http_proxy(&name).await {
            Ok(proxy) => proxy,
            Err(e) if e.is_not_found() => {
                info!("Creating new http proxy for urlmap {}", um_link);
                let proxy = self
                    .cloud
                    .create_target_http_proxy(&TargetHttpProxy {
                        name,
                        url_map: um_link,
                        ..Default::default()
                    })
                    .await?;
                self.tp = Some(proxy);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if !compare_links(&proxy.url_map, &um_link) {
            info!(
                "Proxy {} has the wrong url map, setting {} overwriting {}",
                proxy.name, um_link, proxy.url_map
            );
            self.cloud
                .set_url_map_for_target_http_proxy(&proxy.name, &um_link)
                .await?;
            proxy.url_map = um_link;
        }
        self.tp = Some(proxy);
        Ok(())
    }

    /// The IP both forwarding rules should carry, and whether it belongs to
    /// the controller. An empty IP means any.
    async fn effective_ip(&self) -> (String, bool) {
        let static_name = &self.runtime_info.static_ip_name;
        if !static_name.is_empty() {
            match self.cloud.get_global_address(static_name).await {
                Ok(addr) => return (addr.address, false),
                Err(e) => warn!(
                    "The given static ip name {} doesn't translate to an existing global static ip, ignoring it: {}",
                    static_name, e
                ),
            }
        }
        if let Some(ip) = &self.ip {
            return (ip.address.clone(), true);
        }
        if let Some(fw) = self.fw.as_ref().filter(|fw| !fw.ip_address.is_empty()) {
            return (fw.ip_address.clone(), true);
        }
        (String::new(), true)
    }

    async fn check_http_forwarding_rule(&mut self) -> Result<()> {
        let proxy_link = match &self.tp {
            Some(tp) => tp.self_link.clone(),
            None => {
                return Err(Error::MissingPrerequisite(
                    "cannot create forwarding rule without proxy".to_string(),
                ))
            }
        };
        let name = self.namer.forwarding_rule_name(&self.name, false);
        let (ip, _) = self.effective_ip().await;
        let fw = self
            .check_forwarding_rule(&name, &proxy_link, &ip, HTTP_PORT_RANGE)
            .await?;
        self.fw = Some(fw);
        Ok(())
    }

    async fn check_https_forwarding_rule(&mut self) -> Result<()> {
        let Some(proxy_link) = self.tps.as_ref().map(|tps| tps.self_link.clone()) else {
            debug!("No https proxy for {}, skipping https forwarding rule", self.name);
            return Ok(());
        };
        let name = self.namer.forwarding_rule_name(&self.name, true);
        let (ip, _) = self.effective_ip().await;
        let fws = self
            .check_forwarding_rule(&name, &proxy_link, &ip, HTTPS_PORT_RANGE)
            .await?;
        self.fws = Some(fws);
        Ok(())
    }

    /// A rule with the wrong IP or port range cannot be patched, it is
    /// deleted and recreated. A wrong target is repaired in place.
    async fn check_forwarding_rule(
        &self,
        name: &str,
        proxy_link: &str,
        ip: &str,
        port_range: &str,
    ) -> Result<ForwardingRule> {
        let existing = match self.cloud.get_global_forwarding_rule(name).await {
            Ok(fw) if (!ip.is_empty() && fw.ip_address != ip) || fw.port_range != port_range => {
                warn!(
                    "Recreating forwarding rule {}({}), so it has {}({})",
                    fw.ip_address, fw.port_range, ip, port_range
                );
                match self.cloud.delete_global_forwarding_rule(name).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
                None
            }
            Ok(fw) => Some(fw),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let mut fw = match existing {
            Some(fw) => fw,
            None => {
                info!("Creating forwarding rule for proxy {} and ip {}:{}", proxy_link, ip, port_range);
                return Ok(self
                    .cloud
                    .create_global_forwarding_rule(&ForwardingRule {
                        name: name.to_string(),
                        ip_address: ip.to_string(),
                        ip_protocol: TCP.to_string(),
                        port_range: port_range.to_string(),
                        target: proxy_link.to_string(),
                        ..Default::default()
                    })
                    .await?);
            }
        };

        if !compare_links(&fw.target, proxy_link) {
            info!(
                "Forwarding rule {} has the wrong proxy, setting {} overwriting {}",
                fw.name, proxy_link, fw.target
            );
            self.cloud
                .set_proxy_for_global_forwarding_rule(&fw.name, proxy_link)
                .await?;
            fw.target = proxy_link.to_string();
        }
        Ok(fw)
    }

    /// Promote the ephemeral IP of the HTTP rule to a static one, so the
    /// HTTPS rule and later recreations keep the same address.
    async fn check_static_ip(&mut self) -> Result<()> {
        let ip_address = match self.fw.as_ref().filter(|fw| !fw.ip_address.is_empty()) {
            Some(fw) => fw.ip_address.clone(),
            None => {
                return Err(Error::MissingPrerequisite(
                    "will not create static ip without a forwarding rule".to_string(),
                ))
            }
        };
        if !self.effective_ip().await.1 {
            debug!("Not managing user specified static IP {}", ip_address);
            return Ok(());
        }

        // Named after the HTTP forwarding rule.
        let name = self.namer.forwarding_rule_name(&self.name, false);
        match self.cloud.get_global_address(&name).await {
            Ok(ip) => {
                self.ip = Some(ip);
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        info!("Creating static ip {} for address {}", name, ip_address);
        let reserved = self
            .cloud
            .reserve_global_address(&Address {
                name: name.clone(),
                address: ip_address.clone(),
                ..Default::default()
            })
            .await;
        match reserved {
            Ok(ip) => {
                self.ip = Some(ip);
                Ok(())
            }
            Err(e) if e.is_conflict() || e.is_bad_request() => {
                debug!("Static ip {} for {} already reserved, assuming ok: {}", name, ip_address, e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn check_ssl_cert(&mut self) -> Result<()> {
        let pre_shared = self.runtime_info.tls_name.clone();
        if !pre_shared.is_empty() {
            let cert = self.cloud.get_ssl_certificate(&pre_shared).await?;
            if let Some(current) = self.ssl_cert.take().filter(|c| c.name != cert.name) {
                self.old_ssl_cert = Some(current);
            }
            self.ssl_cert = Some(cert);
            return Ok(());
        }
        let Some(tls) = self.runtime_info.tls.clone() else {
            return Ok(());
        };

        let primary = self.namer.ssl_cert_name(&self.name, false);
        let secondary = self.namer.ssl_cert_name(&self.name, true);
        let in_use = match self.ssl_cert.as_ref() {
            Some(cert) => Some(cert.name.clone()),
            None => self.proxy_cert_name().await?,
        };
        let cert_name = in_use
            .filter(|n| *n == primary || *n == secondary)
            .unwrap_or_else(|| primary.clone());

        let cert = match self.cloud.get_ssl_certificate(&cert_name).await {
            Ok(cert) => Some(cert),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(cert) = &cert {
            if cert.certificate == tls.cert {
                debug!("Certificate {} is up to date", cert.name);
                self.ssl_cert = Some(cert.clone());
                return Ok(());
            }
        }

        // A changed certificate goes to the other slot, so the proxy can be
        // switched over before the old one is deleted.
        let new_name = match &cert {
            Some(_) if cert_name == primary => secondary,
            Some(_) => primary,
            None => cert_name,
        };
        info!("Creating new sslCertificate {} for {}", new_name, self.name);
        let created = self
            .cloud
            .create_ssl_certificate(&SslCertificate {
                name: new_name,
                certificate: tls.cert.clone(),
                private_key: tls.key.clone(),
                ..Default::default()
            })
            .await?;
        self.old_ssl_cert = cert.or_else(|| self.ssl_cert.take());
        self.ssl_cert = Some(created);
        Ok(())
    }

    /// Certificate the live https proxy serves, for picking up the current
    /// slot when nothing is known about it yet.
    async fn proxy_cert_name(&self) -> Result<Option<String>> {
        let name = self.namer.target_https_proxy_name(&self.name);
        match self.cloud.get_target_https_proxy(&name).await {
            Ok(proxy) => Ok(proxy
                .ssl_certificates
                .first()
                .map(|link| resource_name(link).to_string())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn check_https_proxy(&mut self) -> Result<()> {
        let Some(cert_link) = self.ssl_cert.as_ref().map(|c| c.self_link.clone()) else {
            debug!("No ssl certificates for {}, will not create https proxy", self.name);
            return Ok(());
        };
        let um_link = self.url_map_link("https proxy")?;
        let name = self.namer.target_https_proxy_name(&self.name);
        let mut proxy = match self.cloud.get_target_https_proxy(&name).await {
            Ok(proxy) => proxy,
            Err(e) if e.is_not_found() => {
                info!("Creating new https proxy for urlmap {}", um_link);
                let proxy = self
                    .cloud
                    .create_target_https_proxy(&TargetHttpsProxy {
                        name,
                        url_map: um_link,
                        ssl_certificates: vec![cert_link],
                        ..Default::default()
                    })
                    .await?;
                self.tps = Some(proxy);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if !compare_links(&proxy.url_map, &um_link) {
            info!(
                "Https proxy {} has the wrong url map, setting {} overwriting {}",
                proxy.name, um_link, proxy.url_map
            );
            self.cloud
                .set_url_map_for_target_https_proxy(&proxy.name, &um_link)
                .await?;
            proxy.url_map = um_link;
        }
        let current_cert = proxy.ssl_certificates.first().cloned().unwrap_or_default();
        if !compare_links(&current_cert, &cert_link) {
            info!(
                "Https proxy {} has the wrong ssl certs, setting {} overwriting {}",
                proxy.name, cert_link, current_cert
            );
            self.cloud
                .set_ssl_certificate_for_target_https_proxy(&proxy.name, &cert_link)
                .await?;
            proxy.ssl_certificates = vec![cert_link];
        }
        self.tps = Some(proxy);
        Ok(())
    }

    async fn delete_old_ssl_cert(&mut self) -> Result<()> {
        let (Some(old), Some(current)) = (&self.old_ssl_cert, &self.ssl_cert) else {
            return Ok(());
        };
        if old.name == current.name {
            self.old_ssl_cert = None;
            return Ok(());
        }
        // Pre-shared certificates belong to the user.
        if self.namer.is_ssl_cert(&old.name) {
            info!("Cleaning up old ssl certificate {}", old.name);
            match self.cloud.delete_ssl_certificate(&old.name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.old_ssl_cert = None;
        Ok(())
    }

    /// Replace the url map's host rules and path matchers with the given
    /// rules. Nothing is written when the cloud already matches.
    pub async fn update_url_map(&mut self, rules: &GceUrlMap) -> Result<()> {
        let name = match &self.um {
            Some(um) => um.name.clone(),
            None => {
                return Err(Error::MissingPrerequisite(format!(
                    "cannot add url maps to {} without a url map",
                    self.name
                )))
            }
        };
        let default_service = match (rules.default_backend(), &self.glbc_default_backend) {
            (Some(be), _) | (None, Some(be)) => be.self_link.clone(),
            (None, None) => {
                return Err(Error::MissingPrerequisite(format!(
                    "no default backend for url map {}",
                    name
                )))
            }
        };
        let (host_rules, path_matchers) = rules.to_rules(&default_service);

        let current = self.cloud.get_url_map(&name).await?;
        let desired = UrlMap {
            name: name.clone(),
            self_link: current.self_link.clone(),
            default_service,
            host_rules,
            path_matchers,
        };
        if current == desired {
            debug!("Url map {} already up to date", name);
            self.um = Some(current);
            return Ok(());
        }
        info!("Updating url map:\n{}", rules);
        self.um = Some(self.cloud.update_url_map(&desired).await?);
        Ok(())
    }

    /// Delete every resource of the L7, front to back. A resource that is
    /// already gone does not stop the rest.
    pub async fn cleanup(&mut self) -> Result<()> {
        if let Some(fw) = &self.fw {
            info!("Deleting global forwarding rule {}", fw.name);
            tolerate_missing(self.cloud.delete_global_forwarding_rule(&fw.name).await)?;
            self.fw = None;
        }
        if let Some(fws) = &self.fws {
            info!("Deleting global forwarding rule {}", fws.name);
            tolerate_missing(self.cloud.delete_global_forwarding_rule(&fws.name).await)?;
            self.fws = None;
        }
        if let Some(ip) = &self.ip {
            info!("Deleting static IP {}({})", ip.name, ip.address);
            tolerate_missing(self.cloud.delete_global_address(&ip.name).await)?;
            self.ip = None;
        }
        if let Some(tps) = &self.tps {
            info!("Deleting target https proxy {}", tps.name);
            tolerate_missing(self.cloud.delete_target_https_proxy(&tps.name).await)?;
            self.tps = None;
        }
        if let Some(cert) = &self.ssl_cert {
            if self.namer.is_ssl_cert(&cert.name) {
                info!("Deleting sslcert {}", cert.name);
                tolerate_missing(self.cloud.delete_ssl_certificate(&cert.name).await)?;
            }
            self.ssl_cert = None;
        }
        if let Some(tp) = &self.tp {
            info!("Deleting target http proxy {}", tp.name);
            tolerate_missing(self.cloud.delete_target_http_proxy(&tp.name).await)?;
            self.tp = None;
        }
        if let Some(um) = &self.um {
            info!("Deleting url map {}", um.name);
            tolerate_missing(self.cloud.delete_url_map(&um.name).await)?;
            self.um = None;
        }
        Ok(())
    }

    /// External IP of the L7, HTTP rule first.
    pub fn get_ip(&self) -> String {
        [&self.fw, &self.fws]
            .into_iter()
            .flatten()
            .map(|fw| fw.ip_address.clone())
            .find(|ip| !ip.is_empty())
            .unwrap_or_default()
    }

    /// Names of every backend the url map routes to, default included.
    pub fn backend_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let Some(um) = &self.um else {
            return names;
        };
        for pm in &um.path_matchers {
            for rule in &pm.path_rules {
                names.insert(resource_name(&rule.service).to_string());
            }
        }
        if !um.default_service.is_empty() {
            names.insert(resource_name(&um.default_service).to_string());
        }
        names
    }

    /// Status annotations for the Ingress, merged over `existing`. Backend
    /// health is serialized as a JSON object of name to state.
    pub async fn annotations(
        &self,
        mut existing: BTreeMap<String, String>,
        backend_pool: &dyn BackendPool,
    ) -> Result<BTreeMap<String, String>> {
        let mut backend_state = BTreeMap::new();
        for name in self.backend_names() {
            let status = backend_pool.status(&name).await;
            backend_state.insert(name, status);
        }
        let key = |suffix: &str| format!("{}/{}", ANNOTATION_PREFIX, suffix);

        if let Some(um) = &self.um {
            existing.insert(key("url-map"), um.name.clone());
        }
        if let Some(fw) = &self.fw {
            existing.insert(key("forwarding-rule"), fw.name.clone());
        }
        if let Some(tp) = &self.tp {
            existing.insert(key("target-proxy"), tp.name.clone());
        }
        if let Some(fws) = &self.fws {
            existing.insert(key("https-forwarding-rule"), fws.name.clone());
        }
        if let Some(tps) = &self.tps {
            existing.insert(key("https-target-proxy"), tps.name.clone());
        }
        if let Some(ip) = &self.ip {
            existing.insert(key("static-ip"), ip.name.clone());
        }
        if let Some(cert) = &self.ssl_cert {
            existing.insert(key("ssl-cert"), cert.name.clone());
        }
        existing.insert(key("backends"), serde_json::to_string(&backend_state)?);
        Ok(existing)
    }
}

fn tolerate_missing(result: glbc_cloud::Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!("Resource already deleted: {}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
