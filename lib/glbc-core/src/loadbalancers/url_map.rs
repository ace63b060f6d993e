use glbc_cloud::{BackendService, HostRule, PathMatcher, PathRule};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Host used when a rule names none.
pub const DEFAULT_HOST: &str = "*";
/// Path used when a rule names none.
pub const DEFAULT_PATH: &str = "/*";

/// Path matchers are named after the host they serve.
const HOST_RULE_PREFIX: &str = "host";

/// host -> path -> backend, as translated from Ingress rules, plus an
/// optional Ingress-level default backend.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GceUrlMap {
    default_backend: Option<BackendService>,
    hosts: BTreeMap<String, BTreeMap<String, BackendService>>,
}

impl GceUrlMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_default_backend(&mut self, backend: BackendService) {
        self.default_backend = Some(backend);
    }

    pub fn default_backend(&self) -> Option<&BackendService> {
        self.default_backend.as_ref()
    }

    /// Route `path` on `host` to `backend`, replacing an earlier rule for the
    /// same host and path.
    pub fn put_rule(&mut self, host: &str, path: &str, backend: BackendService) {
        self.hosts
            .entry(host.to_string())
            .or_default()
            .insert(path.to_string(), backend);
    }

    pub fn hosts(&self) -> &BTreeMap<String, BTreeMap<String, BackendService>> {
        &self.hosts
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.default_backend.is_none()
    }

    /// One host rule and one path matcher per host. The path matchers
    /// fall back to `default_service`.
    pub(crate) fn to_rules(&self, default_service: &str) -> (Vec<HostRule>, Vec<PathMatcher>) {
        let mut host_rules = Vec::new();
        let mut path_matchers = Vec::new();
        for (host, paths) in &self.hosts {
            let pm_name = path_matcher_name(host);
            host_rules.push(HostRule {
                hosts: vec![host.clone()],
                path_matcher: pm_name.clone(),
            });
            path_matchers.push(PathMatcher {
                name: pm_name,
                default_service: default_service.to_string(),
                path_rules: paths
                    .iter()
                    .map(|(path, be)| PathRule {
                        paths: vec![path.clone()],
                        service: be.self_link.clone(),
                    })
                    .collect(),
            });
        }
        (host_rules, path_matchers)
    }
}

impl fmt::Display for GceUrlMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(be) = &self.default_backend {
            writeln!(f, "default: {}", be.name)?;
        }
        for (host, paths) in &self.hosts {
            writeln!(f, "{}", host)?;
            for (path, be) in paths {
                writeln!(f, "\t{}: {}", path, be.name)?;
            }
        }
        Ok(())
    }
}

/// Host rules may be wildcards, path matcher names may not.
pub fn path_matcher_name(host: &str) -> String {
    let digest = Sha256::digest(host.as_bytes());
    format!("{}{}", HOST_RULE_PREFIX, hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str) -> BackendService {
        BackendService {
            name: name.to_string(),
            self_link: format!("global/backendServices/{}", name),
            ..Default::default()
        }
    }

    #[test]
    fn test_path_matcher_name() {
        let name = path_matcher_name("*.example.com");
        assert!(name.starts_with("host"));
        assert_eq!(name.len(), 4 + 32);
        assert!(name.chars().skip(4).all(|c| c.is_ascii_hexdigit()));
        assert_eq!(name, path_matcher_name("*.example.com"));
        assert_ne!(name, path_matcher_name("example.com"));
    }

    #[test]
    fn test_to_rules() {
        let mut um = GceUrlMap::new();
        um.put_rule("foo.com", "/a", backend("b1"));
        um.put_rule("foo.com", "/b", backend("b2"));
        um.put_rule("bar.com", DEFAULT_PATH, backend("b1"));
        um.put_rule("foo.com", "/a", backend("b3"));

        let (host_rules, path_matchers) = um.to_rules("global/backendServices/default");
        assert_eq!(host_rules.len(), 2);
        assert_eq!(host_rules[0].hosts, vec!["bar.com"]);
        assert_eq!(host_rules[1].path_matcher, path_matcher_name("foo.com"));

        let foo = &path_matchers[1];
        assert_eq!(foo.default_service, "global/backendServices/default");
        assert_eq!(foo.path_rules.len(), 2);
        assert_eq!(foo.path_rules[0].service, "global/backendServices/b3");
        assert!(!um.is_empty());
        assert!(um.to_string().contains("foo.com"));
    }
}
