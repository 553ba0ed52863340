use crate::error::{Result, SchedulerError};
use gpushare_core::{PodDevices, ResourceQuantities, ResourceQuota};
use gpushare_device::{QuotaKind, QuotaResource};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Prefix of the hard-limit keys read from a ResourceQuota
const LIMITS_PREFIX: &str = "limits.";

/// Usage and hard limit of one resource in one namespace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceQuota {
    pub used: i64,
    /// 0 means unlimited
    pub limit: i64,
}

impl DeviceQuota {
    /// Whether `request` more stays within the limit
    pub fn fits(&self, request: i64) -> bool {
        self.limit == 0 || self.used + request <= self.limit
    }
}

/// Namespace device quotas, namespace -> resource -> usage
pub struct QuotaManager {
    resources: Vec<QuotaResource>,
    quotas: RwLock<BTreeMap<String, BTreeMap<String, DeviceQuota>>>,
}

impl QuotaManager {
    /// Track the given managed resources
    pub fn new(resources: Vec<QuotaResource>) -> Self {
        Self {
            resources,
            quotas: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn is_managed(&self, name: &str) -> bool {
        self.resources.iter().any(|r| r.name == name)
    }

    /// Per-resource amounts that `devices` count against a namespace
    pub fn usage_of(&self, devices: &PodDevices) -> BTreeMap<String, i64> {
        let mut usage = BTreeMap::new();
        for resource in &self.resources {
            let Some(containers) = devices.get(resource.vendor) else {
                continue;
            };
            let grants = containers.iter().flatten();
            let amount = match resource.kind {
                QuotaKind::Memory { unit } => {
                    let mib: u64 = grants.map(|g| g.usedmem).sum();
                    mib.div_ceil(unit) as i64
                }
                QuotaKind::Cores => grants.map(|g| g.usedcores as i64).sum(),
            };
            usage.insert(resource.name.to_string(), amount);
        }
        usage
    }

    /// Whether `request` more of `resource` stays within the namespace limit
    pub fn fit_quota(&self, namespace: &str, resource: &str, request: i64) -> bool {
        let quotas = self.quotas.read();
        match quotas.get(namespace).and_then(|q| q.get(resource)) {
            Some(q) => q.fits(request),
            None => true,
        }
    }

    /// First managed resource that `devices` would push over its limit
    pub fn exceeded_by(&self, namespace: &str, devices: &PodDevices) -> Option<String> {
        self.usage_of(devices)
            .into_iter()
            .find(|(resource, amount)| !self.fit_quota(namespace, resource, *amount))
            .map(|(resource, _)| resource)
    }

    pub fn add_usage(&self, namespace: &str, devices: &PodDevices) {
        let usage = self.usage_of(devices);
        let mut quotas = self.quotas.write();
        let ns = quotas.entry(namespace.to_string()).or_default();
        for (resource, amount) in usage {
            ns.entry(resource).or_default().used += amount;
        }
    }

    /// Add usage only when every resource stays within its limit
    ///
    /// The check and the add happen under one write lock, so two pods can
    /// never both claim the last of a namespace's quota.
    pub fn try_add_usage(&self, namespace: &str, devices: &PodDevices) -> Result<()> {
        let usage = self.usage_of(devices);
        let mut quotas = self.quotas.write();
        let ns = quotas.entry(namespace.to_string()).or_default();
        for (resource, amount) in &usage {
            if let Some(q) = ns.get(resource) {
                if !q.fits(*amount) {
                    return Err(SchedulerError::quota_exceeded(
                        namespace, resource, q.used, *amount, q.limit,
                    ));
                }
            }
        }
        for (resource, amount) in usage {
            ns.entry(resource).or_default().used += amount;
        }
        Ok(())
    }

    /// Remove usage added by [`Self::add_usage`]
    ///
    /// Fails without changing anything when a release exceeds recorded usage.
    pub fn rm_usage(&self, namespace: &str, devices: &PodDevices) -> Result<()> {
        let usage = self.usage_of(devices);
        let mut quotas = self.quotas.write();
        let ns = quotas.entry(namespace.to_string()).or_default();
        for (resource, amount) in &usage {
            let used = ns.get(resource).map(|q| q.used).unwrap_or(0);
            if used < *amount {
                return Err(SchedulerError::quota_underflow(
                    namespace, resource, used, *amount,
                ));
            }
        }
        for (resource, amount) in usage {
            if let Some(q) = ns.get_mut(&resource) {
                q.used -= amount;
            }
        }
        Ok(())
    }

    /// Record the hard limits of managed resources from a ResourceQuota
    pub fn add_quota(&self, quota: &ResourceQuota) -> Result<()> {
        let namespace = quota.metadata.namespace.as_deref().unwrap_or("default");
        let hard = quota
            .spec
            .as_ref()
            .and_then(|s| s.hard.as_ref())
            .cloned()
            .unwrap_or_default();

        let mut limits = Vec::new();
        for (key, value) in &hard {
            if let Some(name) = key.strip_prefix(LIMITS_PREFIX) {
                if self.is_managed(name) {
                    limits.push((name.to_string(), ResourceQuantities::parse(&value.0)?));
                }
            }
        }
        if limits.is_empty() {
            return Ok(());
        }

        let mut quotas = self.quotas.write();
        let ns = quotas.entry(namespace.to_string()).or_default();
        for (name, limit) in limits {
            info!(namespace, resource = %name, limit, "Device quota set");
            ns.entry(name).or_default().limit = limit;
        }
        Ok(())
    }

    /// Drop the hard limits a ResourceQuota set, keeping recorded usage
    pub fn del_quota(&self, quota: &ResourceQuota) {
        let namespace = quota.metadata.namespace.as_deref().unwrap_or("default");
        let Some(hard) = quota.spec.as_ref().and_then(|s| s.hard.as_ref()) else {
            return;
        };
        let mut quotas = self.quotas.write();
        let Some(ns) = quotas.get_mut(namespace) else {
            return;
        };
        for key in hard.keys() {
            if let Some(name) = key.strip_prefix(LIMITS_PREFIX) {
                if let Some(q) = ns.get_mut(name) {
                    q.limit = 0;
                    debug!(namespace, resource = name, "Device quota removed");
                }
            }
        }
    }

    pub fn get(&self, namespace: &str, resource: &str) -> Option<DeviceQuota> {
        self.quotas
            .read()
            .get(namespace)
            .and_then(|q| q.get(resource))
            .copied()
    }
}
