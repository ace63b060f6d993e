//! Cloud resource naming
//!
//! Every resource the controller creates carries the cluster uid, so that
//! two clusters sharing a project never collide and resources left behind by
//! a previous controller instance can be recognized. Names are limited to 63
//! characters and must end in an alphanumeric.

use sha2::{Digest, Sha256};
use std::sync::{PoisonError, RwLock};
use tracing::{trace, warn};

use crate::error::{Error, Result};

pub const BACKEND_PREFIX: &str = "k8s-be";
pub const INSTANCE_GROUP_PREFIX: &str = "k8s-ig";
pub const TARGET_PROXY_PREFIX: &str = "k8s-tp";
pub const TARGET_HTTPS_PROXY_PREFIX: &str = "k8s-tps";
pub const SSL_CERT_PREFIX: &str = "k8s-ssl";
pub const FORWARDING_RULE_PREFIX: &str = "k8s-fw";
pub const HTTPS_FORWARDING_RULE_PREFIX: &str = "k8s-fws";
pub const URL_MAP_PREFIX: &str = "k8s-um";
pub const NEG_PREFIX: &str = "k8s1";

/// Suffix of the single L7 firewall rule. The rule name carries its own
/// `k8s-fw` prefix so it is never confused with an L4 rule.
pub const GLOBAL_FIREWALL_SUFFIX: &str = "l7";

pub const CLUSTER_NAME_DELIMITER: &str = "--";

/// Names longer than this are truncated.
pub const NAME_LEN_LIMIT: usize = 62;
pub const MAX_RESOURCE_NAME_LEN: usize = 63;

/// Appended after truncation so a name never ends in '-'.
const ALPHA_NUMERIC_CHAR: char = '0';

const NEG_HASH_LEN: usize = 8;
const NEG_UID_LEN: usize = 8;

#[derive(Debug, Default)]
struct Uids {
    cluster: String,
    firewall: String,
}

/// Pieces recovered from a resource name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameComponents {
    /// The uid after the delimiter, empty for undecorated names.
    pub cluster_uid: String,
    /// Resource kind prefix, e.g. `k8s-be`. Empty if unrecognized.
    pub resource: String,
}

/// Shared naming state. The uids may change at runtime (e.g. from a config
/// watch); every name is computed from their current value.
#[derive(Debug, Default)]
pub struct Namer {
    uids: RwLock<Uids>,
}

impl Namer {
    /// An empty firewall uid falls back to the cluster uid.
    pub fn new(cluster_uid: impl Into<String>, firewall_uid: impl Into<String>) -> Self {
        let cluster = cluster_uid.into();
        let mut firewall = firewall_uid.into();
        if firewall.is_empty() {
            firewall = cluster.clone();
        }
        Self {
            uids: RwLock::new(Uids { cluster, firewall }),
        }
    }

    pub fn set_uid(&self, uid: impl Into<String>) {
        let uid = uid.into();
        let mut uids = self.uids.write().unwrap_or_else(PoisonError::into_inner);
        if uid.contains(CLUSTER_NAME_DELIMITER) {
            // Keep only the trailing component, older controllers wrote the
            // uid with the delimiter included.
            let parts: Vec<&str> = uid.split(CLUSTER_NAME_DELIMITER).collect();
            warn!("Given name {} contains {}, taking last name in list", uid, CLUSTER_NAME_DELIMITER);
            uids.cluster = parts.last().copied().unwrap_or_default().to_string();
        } else {
            uids.cluster = uid;
        }
    }

    pub fn set_firewall(&self, firewall_uid: impl Into<String>) {
        let mut uids = self.uids.write().unwrap_or_else(PoisonError::into_inner);
        uids.firewall = firewall_uid.into();
    }

    pub fn uid(&self) -> String {
        self.uids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .cluster
            .clone()
    }

    pub fn firewall(&self) -> String {
        self.uids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .firewall
            .clone()
    }

    /// Truncate to the name length limit. A truncated name ends in '0'.
    pub fn truncate(&self, key: &str) -> String {
        if key.chars().count() > NAME_LEN_LIMIT {
            let mut truncated: String = key.chars().take(NAME_LEN_LIMIT).collect();
            truncated.push(ALPHA_NUMERIC_CHAR);
            truncated
        } else {
            key.to_string()
        }
    }

    fn decorate_name(&self, name: &str) -> String {
        let uid = self.uid();
        if uid.is_empty() {
            name.to_string()
        } else {
            self.truncate(&format!("{}{}{}", name, CLUSTER_NAME_DELIMITER, uid))
        }
    }

    /// True if the name is tagged with this cluster's uid.
    pub fn name_belongs_to_cluster(&self, name: &str) -> bool {
        if !name.starts_with("k8s-") {
            trace!("{} not part of cluster", name);
            return false;
        }
        let uid = self.uid();
        let parts: Vec<&str> = name.split(CLUSTER_NAME_DELIMITER).collect();
        match parts.len() {
            1 => uid.is_empty(),
            2 => parts[1] == uid,
            _ => {
                warn!("Too many parts to name {}, ignoring", name);
                false
            }
        }
    }

    /// Inverse of the decorated names.
    pub fn parse_name(&self, name: &str) -> NameComponents {
        let mut parts = name.splitn(2, CLUSTER_NAME_DELIMITER);
        let base = parts.next().unwrap_or_default();
        let cluster_uid = parts.next().unwrap_or_default().to_string();
        let resource = [
            TARGET_HTTPS_PROXY_PREFIX,
            HTTPS_FORWARDING_RULE_PREFIX,
            SSL_CERT_PREFIX,
            BACKEND_PREFIX,
            INSTANCE_GROUP_PREFIX,
            TARGET_PROXY_PREFIX,
            FORWARDING_RULE_PREFIX,
            URL_MAP_PREFIX,
        ]
        .iter()
        .find(|p| base == **p || base.starts_with(&format!("{}-", p)))
        .map(|p| p.to_string())
        .unwrap_or_default();
        NameComponents {
            cluster_uid,
            resource,
        }
    }

    pub fn be_name(&self, port: i64) -> String {
        self.decorate_name(&format!("{}-{}", BACKEND_PREFIX, port))
    }

    /// Port encoded in a backend name.
    pub fn be_port(&self, be_name: &str) -> Result<i64> {
        let prefix = format!("{}-", BACKEND_PREFIX);
        let rest = be_name
            .find(&prefix)
            .map(|i| &be_name[i + prefix.len()..])
            .ok_or_else(|| Error::InvalidName(format!("Unable to lookup port for {}", be_name)))?;
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits
            .parse::<i64>()
            .map_err(|_| Error::InvalidName(format!("Unable to lookup port for {}", be_name)))
    }

    /// All ports share a single instance group per zone.
    pub fn ig_name(&self) -> String {
        self.decorate_name(INSTANCE_GROUP_PREFIX)
    }

    pub fn fr_suffix(&self) -> String {
        let firewall = self.firewall();
        if firewall.is_empty() {
            GLOBAL_FIREWALL_SUFFIX.to_string()
        } else {
            self.truncate(&format!(
                "{}{}{}",
                GLOBAL_FIREWALL_SUFFIX, CLUSTER_NAME_DELIMITER, firewall
            ))
        }
    }

    pub fn fr_name(&self, suffix: &str) -> String {
        format!("{}-{}", FORWARDING_RULE_PREFIX, suffix)
    }

    /// Name of the cluster-wide L7 firewall rule.
    pub fn firewall_rule_name(&self) -> String {
        self.fr_name(&self.fr_suffix())
    }

    /// Load balancer name for an Ingress key (usually namespace/name).
    pub fn lb_name(&self, key: &str) -> String {
        let uid = self.uid();
        let scrubbed = key.replace('/', "-");
        let last = key.rsplit(CLUSTER_NAME_DELIMITER).next().unwrap_or_default();
        if uid.is_empty() || last == uid {
            scrubbed
        } else {
            self.truncate(&format!("{}{}{}", scrubbed, CLUSTER_NAME_DELIMITER, uid))
        }
    }

    pub fn url_map_name(&self, lb_name: &str) -> String {
        self.truncate(&format!("{}-{}", URL_MAP_PREFIX, lb_name))
    }

    pub fn target_proxy_name(&self, lb_name: &str) -> String {
        self.truncate(&format!("{}-{}", TARGET_PROXY_PREFIX, lb_name))
    }

    pub fn target_https_proxy_name(&self, lb_name: &str) -> String {
        self.truncate(&format!("{}-{}", TARGET_HTTPS_PROXY_PREFIX, lb_name))
    }

    /// Name of the HTTP or HTTPS forwarding rule. The HTTP name doubles as
    /// the name of the static IP reserved for the L7.
    pub fn forwarding_rule_name(&self, lb_name: &str, https: bool) -> String {
        let prefix = if https {
            HTTPS_FORWARDING_RULE_PREFIX
        } else {
            FORWARDING_RULE_PREFIX
        };
        self.truncate(&format!("{}-{}", prefix, lb_name))
    }

    /// The two certificate slots an L7 alternates between. The slot index
    /// goes before the lb name so truncation never drops it.
    pub fn ssl_cert_name(&self, lb_name: &str, secondary: bool) -> String {
        if secondary {
            self.truncate(&format!("{}-1-{}", SSL_CERT_PREFIX, lb_name))
        } else {
            self.truncate(&format!("{}-{}", SSL_CERT_PREFIX, lb_name))
        }
    }

    pub fn is_ssl_cert(&self, name: &str) -> bool {
        name.starts_with(&format!("{}-", SSL_CERT_PREFIX))
    }

    /// Prefix shared by every NEG this cluster owns.
    pub fn neg_prefix(&self) -> String {
        let uid = self.uid();
        let short: String = uid.chars().take(NEG_UID_LEN).collect();
        format!("{}-{}", NEG_PREFIX, short)
    }

    /// NEG name for a service port:
    /// `k8s1-<uid8>-<namespace>-<name>-<port>-<hash8>`, at most 63 chars.
    /// The descriptive fields are trimmed evenly, the hash keeps trimmed
    /// names unique.
    pub fn neg_name(&self, namespace: &str, name: &str, port: &str) -> String {
        let prefix = self.neg_prefix();
        let budget = MAX_RESOURCE_NAME_LEN
            .saturating_sub(prefix.len())
            .saturating_sub(4 + NEG_HASH_LEN);
        let fields = trim_fields_evenly(budget, &[namespace, name, port]);
        format!(
            "{}-{}-{}-{}-{}",
            prefix,
            fields[0],
            fields[1],
            fields[2],
            self.neg_suffix(namespace, name, port)
        )
    }

    pub fn is_neg(&self, name: &str) -> bool {
        name.starts_with(&format!("{}-", self.neg_prefix()))
    }

    fn neg_suffix(&self, namespace: &str, name: &str, port: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{};{};{};{}", self.uid(), namespace, name, port));
        let digest = hex::encode(hasher.finalize());
        digest[..NEG_HASH_LEN].to_string()
    }
}

/// Shorten the longest field one char at a time until the total fits.
fn trim_fields_evenly(max: usize, fields: &[&str]) -> Vec<String> {
    let mut out: Vec<Vec<char>> = fields.iter().map(|f| f.chars().collect()).collect();
    let mut total: usize = out.iter().map(Vec::len).sum();
    while total > max {
        let Some(longest) = (0..out.len()).max_by_key(|i| (out[*i].len(), std::cmp::Reverse(*i))) else {
            break;
        };
        if out[longest].is_empty() {
            break;
        }
        out[longest].pop();
        total -= 1;
    }
    out.into_iter().map(|f| f.into_iter().collect()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        let namer = Namer::new("uid1", "");
        let long = "a".repeat(70);
        let truncated = namer.truncate(&long);
        assert_eq!(truncated.len(), NAME_LEN_LIMIT + 1);
        assert!(truncated.ends_with('0'));
        assert_eq!(namer.truncate("short"), "short");
    }

    #[test]
    fn test_decorated_names() {
        let namer = Namer::new("uid1", "");
        assert_eq!(namer.be_name(80), "k8s-be-80--uid1");
        assert_eq!(namer.ig_name(), "k8s-ig--uid1");
        assert_eq!(namer.fr_suffix(), "l7--uid1");
        assert_eq!(namer.firewall_rule_name(), "k8s-fw-l7--uid1");

        let bare = Namer::new("", "");
        assert_eq!(bare.be_name(80), "k8s-be-80");
        assert_eq!(bare.ig_name(), "k8s-ig");
        assert_eq!(bare.firewall_rule_name(), "k8s-fw-l7");
    }

    #[test]
    fn test_firewall_uid_is_independent() {
        let namer = Namer::new("uid1", "fw1");
        assert_eq!(namer.fr_suffix(), "l7--fw1");
        namer.set_firewall("fw2");
        assert_eq!(namer.fr_suffix(), "l7--fw2");
        assert_eq!(namer.uid(), "uid1");
    }

    #[test]
    fn test_be_port() {
        let namer = Namer::new("uid1", "");
        assert_eq!(namer.be_port("k8s-be-30001--uid1").unwrap(), 30001);
        assert_eq!(namer.be_port("k8s-be-80").unwrap(), 80);
        assert!(namer.be_port("k8s-um-foo").is_err());
        assert!(namer.be_port("k8s-be-abc").is_err());
    }

    #[test]
    fn test_name_belongs_to_cluster() {
        let namer = Namer::new("uid1", "");
        assert!(namer.name_belongs_to_cluster("k8s-be-80--uid1"));
        assert!(!namer.name_belongs_to_cluster("k8s-be-80--uid2"));
        assert!(!namer.name_belongs_to_cluster("k8s-be-80"));
        assert!(!namer.name_belongs_to_cluster("foo-be-80--uid1"));
        assert!(!namer.name_belongs_to_cluster("k8s-be-80--uid1--x"));

        let bare = Namer::new("", "");
        assert!(bare.name_belongs_to_cluster("k8s-be-80"));
    }

    #[test]
    fn test_set_uid_strips_delimiter() {
        let namer = Namer::new("", "");
        namer.set_uid("old--new");
        assert_eq!(namer.uid(), "new");
        assert_eq!(namer.be_name(80), "k8s-be-80--new");
    }

    #[test]
    fn test_lb_names() {
        let namer = Namer::new("uid1", "");
        let lb = namer.lb_name("default/foo");
        assert_eq!(lb, "default-foo--uid1");
        assert_eq!(namer.lb_name(&lb), lb);
        assert_eq!(namer.url_map_name(&lb), "k8s-um-default-foo--uid1");
        assert_eq!(namer.target_proxy_name(&lb), "k8s-tp-default-foo--uid1");
        assert_eq!(namer.target_https_proxy_name(&lb), "k8s-tps-default-foo--uid1");
        assert_eq!(namer.forwarding_rule_name(&lb, false), "k8s-fw-default-foo--uid1");
        assert_eq!(namer.forwarding_rule_name(&lb, true), "k8s-fws-default-foo--uid1");
        assert_eq!(namer.ssl_cert_name(&lb, false), "k8s-ssl-default-foo--uid1");
        assert_eq!(namer.ssl_cert_name(&lb, true), "k8s-ssl-1-default-foo--uid1");
        assert!(namer.is_ssl_cert("k8s-ssl-1-default-foo--uid1"));
        assert!(!namer.is_ssl_cert("my-cert"));
    }

    #[test]
    fn test_parse_name() {
        let namer = Namer::new("uid1", "");
        let parsed = namer.parse_name("k8s-tps-default-foo--uid1");
        assert_eq!(parsed.cluster_uid, "uid1");
        assert_eq!(parsed.resource, TARGET_HTTPS_PROXY_PREFIX);

        let parsed = namer.parse_name(&namer.be_name(80));
        assert_eq!(parsed.resource, BACKEND_PREFIX);

        let parsed = namer.parse_name("something-else");
        assert_eq!(parsed.cluster_uid, "");
        assert_eq!(parsed.resource, "");
    }

    #[test]
    fn test_neg_name() {
        let namer = Namer::new("0123456789abcdef", "");
        let name = namer.neg_name("ns", "svc", "80");
        assert!(name.starts_with("k8s1-01234567-ns-svc-80-"));
        assert!(namer.is_neg(&name));
        assert_eq!(name.len(), "k8s1-01234567-ns-svc-80-".len() + 8);

        let long = namer.neg_name(&"n".repeat(40), &"s".repeat(40), "8080");
        assert!(long.len() <= MAX_RESOURCE_NAME_LEN);
        assert!(namer.is_neg(&long));
        // Distinct inputs that trim to the same fields still differ.
        let other = namer.neg_name(&"n".repeat(41), &"s".repeat(40), "8080");
        assert_ne!(long, other);

        let foreign = Namer::new("fedcba9876543210", "");
        assert!(!foreign.is_neg(&name));
    }

    #[test]
    fn test_trim_fields_evenly() {
        let trimmed = trim_fields_evenly(6, &["aaaa", "bbbb", "1"]);
        assert_eq!(trimmed.iter().map(String::len).sum::<usize>(), 6);
        assert_eq!(trimmed[2], "1");
        assert_eq!(trim_fields_evenly(100, &["a", "b"]), vec!["a", "b"]);
    }
}
