//! Fake firewall rules

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use super::{global_link, lock, CallLog, Faults};
use crate::error::{CloudError, Result};
use crate::interfaces::Firewalls;
use crate::resources::*;

pub const FAKE_NETWORK: &str = "default";

/// Node tags are the node names themselves.
#[derive(Default, Debug)]
pub struct FakeFirewalls {
    rules: Mutex<BTreeMap<String, Firewall>>,
    pub calls: CallLog,
    pub faults: Faults,
}

impl FakeFirewalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a rule without recording a call.
    pub fn put(&self, firewall: Firewall) {
        lock(&self.rules).insert(firewall.name.clone(), firewall);
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.rules).keys().cloned().collect()
    }
}

#[async_trait]
impl Firewalls for FakeFirewalls {
    async fn get_firewall(&self, name: &str) -> Result<Firewall> {
        self.faults.check("get_firewall")?;
        lock(&self.rules)
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("firewall {}", name)))
    }

    async fn create_firewall(&self, firewall: &Firewall) -> Result<()> {
        self.calls.record("create_firewall", &firewall.name);
        self.faults.check("create_firewall")?;
        let mut rules = lock(&self.rules);
        if rules.contains_key(&firewall.name) {
            return Err(CloudError::conflict(format!("firewall {} exists", firewall.name)));
        }
        let mut created = firewall.clone();
        created.self_link = global_link("firewalls", &firewall.name);
        rules.insert(firewall.name.clone(), created);
        Ok(())
    }

    async fn update_firewall(&self, firewall: &Firewall) -> Result<()> {
        self.calls.record("update_firewall", &firewall.name);
        self.faults.check("update_firewall")?;
        let mut rules = lock(&self.rules);
        match rules.get_mut(&firewall.name) {
            Some(existing) => {
                let self_link = existing.self_link.clone();
                *existing = firewall.clone();
                existing.self_link = self_link;
                Ok(())
            }
            None => Err(CloudError::not_found(format!("firewall {}", firewall.name))),
        }
    }

    async fn delete_firewall(&self, name: &str) -> Result<()> {
        self.calls.record("delete_firewall", name);
        self.faults.check("delete_firewall")?;
        lock(&self.rules)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found(format!("firewall {}", name)))
    }

    async fn get_node_tags(&self, node_names: &[String]) -> Result<Vec<String>> {
        self.faults.check("get_node_tags")?;
        let tags: BTreeSet<String> = node_names.iter().cloned().collect();
        Ok(tags.into_iter().collect())
    }

    fn network_url(&self) -> String {
        global_link("networks", FAKE_NETWORK)
    }
}
