use crate::error::{Result, SchedulerError};
use gpushare_core::types::pod_devices_iter;
use gpushare_core::{DeviceUsage, NodeInfo, NodeUsage, PodDevices, EXCLUSIVE_CORES};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Registered nodes and the live usage counters of their devices
#[derive(Default)]
pub struct NodeManager {
    nodes: RwLock<BTreeMap<String, NodeUsage>>,
}

impl NodeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a node's devices
    ///
    /// Devices of the vendors present in `info` replace that vendor's previous
    /// devices; other vendors' devices on the node are kept. Counters of
    /// devices that keep their UUID carry over.
    pub fn add_node(&self, id: &str, info: NodeInfo) {
        if info.devices.is_empty() {
            return;
        }
        let vendors: BTreeSet<&str> = info.devices.iter().map(|d| d.vendor.as_str()).collect();
        let mut nodes = self.nodes.write();
        let entry = nodes.entry(id.to_string()).or_insert_with(|| NodeUsage {
            id: id.to_string(),
            node: info.node.clone(),
            devices: Vec::new(),
        });
        entry.node = info.node.clone();

        let previous: BTreeMap<String, DeviceUsage> = entry
            .devices
            .iter()
            .filter(|d| vendors.contains(d.vendor.as_str()))
            .map(|d| (d.id.clone(), d.clone()))
            .collect();
        entry.devices.retain(|d| !vendors.contains(d.vendor.as_str()));
        for dev in &info.devices {
            let mut usage = DeviceUsage::from_info(dev);
            if let Some(old) = previous.get(&dev.id) {
                usage.used = old.used;
                usage.usedmem = old.usedmem;
                usage.usedcores = old.usedcores;
            }
            entry.devices.push(usage);
        }
        debug!(node = id, devices = entry.devices.len(), "Node devices updated");
    }

    /// Current view of a node
    pub fn get_node(&self, id: &str) -> Result<NodeUsage> {
        self.nodes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::node_not_found(id))
    }

    pub fn list_nodes(&self) -> BTreeMap<String, NodeUsage> {
        self.nodes.read().clone()
    }

    /// Drop one vendor's devices from a node, removing the node when none remain
    pub fn rm_node_device(&self, id: &str, vendor: &str) {
        let mut nodes = self.nodes.write();
        let empty = match nodes.get_mut(id) {
            Some(node) => {
                node.devices.retain(|d| d.vendor != vendor);
                node.devices.is_empty()
            }
            None => return,
        };
        if empty {
            nodes.remove(id);
        }
        info!(node = id, vendor, "Removed node devices");
    }

    /// Forget a node entirely
    pub fn remove_node(&self, id: &str) -> bool {
        let removed = self.nodes.write().remove(id).is_some();
        if removed {
            info!(node = id, "Removed node");
        }
        removed
    }

    /// Apply `devices` to the node's counters after re-checking capacity
    ///
    /// Either every grant is applied or none is.
    pub fn commit(&self, pod_name: &str, id: &str, devices: &PodDevices) -> Result<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| SchedulerError::node_not_found(id))?;

        let mut staged = node.devices.clone();
        for grant in pod_devices_iter(devices) {
            let dev = staged
                .iter_mut()
                .find(|d| d.id == grant.uuid)
                .ok_or_else(|| {
                    SchedulerError::commit_conflict(
                        pod_name,
                        id,
                        format!("device {} is not registered", grant.uuid),
                    )
                })?;
            if let Some(reason) = conflict(dev, grant.usedmem, grant.usedcores) {
                return Err(SchedulerError::commit_conflict(
                    pod_name,
                    id,
                    format!("device {}: {}", grant.uuid, reason),
                ));
            }
            dev.add_usage(grant);
        }
        node.devices = staged;
        debug!(pod = pod_name, node = id, "Committed device usage");
        Ok(())
    }

    /// Apply `devices` without capacity checks, skipping unknown devices
    ///
    /// Used to rebuild counters from pods that are already placed.
    pub fn restore(&self, id: &str, devices: &PodDevices) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get_mut(id) {
            for grant in pod_devices_iter(devices) {
                if let Some(dev) = node.device_mut(&grant.uuid) {
                    dev.add_usage(grant);
                }
            }
        }
    }

    /// Return `devices` to the node's counters
    pub fn release(&self, id: &str, devices: &PodDevices) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get_mut(id) {
            for grant in pod_devices_iter(devices) {
                if let Some(dev) = node.device_mut(&grant.uuid) {
                    dev.remove_usage(grant);
                }
            }
            debug!(node = id, "Released device usage");
        }
    }
}

/// Why one more grant of `mem`/`cores` no longer fits on `dev`
fn conflict(dev: &DeviceUsage, mem: u64, cores: u32) -> Option<&'static str> {
    if !dev.has_free_slot() {
        Some("no free slot")
    } else if dev.free_mem() < mem {
        Some("insufficient memory")
    } else if dev.free_cores() < cores {
        Some("insufficient cores")
    } else if cores == EXCLUSIVE_CORES && dev.used > 0 {
        Some("exclusive use requested on a shared device")
    } else if dev.totalcore != 0 && dev.usedcores == dev.totalcore && cores == 0 {
        Some("compute units exhausted")
    } else {
        None
    }
}
