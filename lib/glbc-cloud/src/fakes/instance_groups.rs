//! Fake zonal instance groups

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use super::{lock, zonal_link, CallLog, Faults};
use crate::error::{CloudError, Result};
use crate::interfaces::InstanceGroups;
use crate::resources::*;

#[derive(Debug)]
struct FakeGroup {
    group: InstanceGroup,
    instances: BTreeSet<String>,
}

/// Groups are keyed by (zone, name).
#[derive(Default, Debug)]
pub struct FakeInstanceGroups {
    groups: Mutex<BTreeMap<(String, String), FakeGroup>>,
    pub calls: CallLog,
    pub faults: Faults,
}

impl FakeInstanceGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the instances in a group, or None if the group doesn't exist.
    pub fn instance_names(&self, name: &str, zone: &str) -> Option<Vec<String>> {
        lock(&self.groups)
            .get(&(zone.to_string(), name.to_string()))
            .map(|g| g.instances.iter().cloned().collect())
    }

    pub fn named_ports(&self, name: &str, zone: &str) -> Option<Vec<NamedPort>> {
        lock(&self.groups)
            .get(&(zone.to_string(), name.to_string()))
            .map(|g| g.group.named_ports.clone())
    }

    pub fn exists(&self, name: &str, zone: &str) -> bool {
        lock(&self.groups).contains_key(&(zone.to_string(), name.to_string()))
    }

    fn not_found(name: &str, zone: &str) -> CloudError {
        CloudError::not_found(format!("instance group {} in {}", name, zone))
    }
}

#[async_trait]
impl InstanceGroups for FakeInstanceGroups {
    async fn get_instance_group(&self, name: &str, zone: &str) -> Result<InstanceGroup> {
        self.faults.check("get_instance_group")?;
        lock(&self.groups)
            .get(&(zone.to_string(), name.to_string()))
            .map(|g| g.group.clone())
            .ok_or_else(|| Self::not_found(name, zone))
    }

    async fn create_instance_group(&self, name: &str, zone: &str) -> Result<InstanceGroup> {
        self.calls.record("create_instance_group", &format!("{}/{}", zone, name));
        self.faults.check("create_instance_group")?;
        let mut groups = lock(&self.groups);
        let key = (zone.to_string(), name.to_string());
        if groups.contains_key(&key) {
            return Err(CloudError::conflict(format!("instance group {} exists in {}", name, zone)));
        }
        let group = InstanceGroup {
            name: name.to_string(),
            zone: zone.to_string(),
            self_link: zonal_link(zone, "instanceGroups", name),
            ..Default::default()
        };
        groups.insert(
            key,
            FakeGroup {
                group: group.clone(),
                instances: BTreeSet::new(),
            },
        );
        Ok(group)
    }

    async fn delete_instance_group(&self, name: &str, zone: &str) -> Result<()> {
        self.calls.record("delete_instance_group", &format!("{}/{}", zone, name));
        self.faults.check("delete_instance_group")?;
        lock(&self.groups)
            .remove(&(zone.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(name, zone))
    }

    async fn list_instances_in_instance_group(&self, name: &str, zone: &str) -> Result<Vec<String>> {
        self.faults.check("list_instances_in_instance_group")?;
        lock(&self.groups)
            .get(&(zone.to_string(), name.to_string()))
            .map(|g| {
                g.instances
                    .iter()
                    .map(|i| zonal_link(zone, "instances", i))
                    .collect()
            })
            .ok_or_else(|| Self::not_found(name, zone))
    }

    async fn add_instances_to_instance_group(&self, name: &str, zone: &str, instances: &[String]) -> Result<()> {
        self.calls
            .record("add_instances_to_instance_group", &format!("{}/{}", zone, name));
        self.faults.check("add_instances_to_instance_group")?;
        let mut groups = lock(&self.groups);
        let group = groups
            .get_mut(&(zone.to_string(), name.to_string()))
            .ok_or_else(|| Self::not_found(name, zone))?;
        group.instances.extend(instances.iter().cloned());
        group.group.size = group.instances.len() as i64;
        Ok(())
    }

    async fn remove_instances_from_instance_group(&self, name: &str, zone: &str, instances: &[String]) -> Result<()> {
        self.calls
            .record("remove_instances_from_instance_group", &format!("{}/{}", zone, name));
        self.faults.check("remove_instances_from_instance_group")?;
        let mut groups = lock(&self.groups);
        let group = groups
            .get_mut(&(zone.to_string(), name.to_string()))
            .ok_or_else(|| Self::not_found(name, zone))?;
        for instance in instances {
            group.instances.remove(instance);
        }
        group.group.size = group.instances.len() as i64;
        Ok(())
    }

    async fn set_named_ports_of_instance_group(&self, name: &str, zone: &str, ports: &[NamedPort]) -> Result<()> {
        self.calls
            .record("set_named_ports_of_instance_group", &format!("{}/{}", zone, name));
        self.faults.check("set_named_ports_of_instance_group")?;
        let mut groups = lock(&self.groups);
        let group = groups
            .get_mut(&(zone.to_string(), name.to_string()))
            .ok_or_else(|| Self::not_found(name, zone))?;
        group.group.named_ports = ports.to_vec();
        Ok(())
    }
}
