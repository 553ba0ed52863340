use crate::amd::AmdDevice;
use crate::cambricon::CambriconDevice;
use crate::config::DeviceConfig;
use crate::enflame::EnflameDevice;
use crate::error::{DeviceError, Result};
use crate::kunlun::KunlunDevice;
use crate::nvidia::NvidiaDevice;
use crate::traits::Device;
use gpushare_core::codec;
use gpushare_core::{ContainerDeviceRequests, Pod, PodDeviceRequests, PodDevices, PodExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Vendor name to capability table, built once at startup
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<&'static str, Arc<dyn Device>>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every supported vendor
    pub fn with_defaults(config: &DeviceConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NvidiaDevice::new(config)));
        registry.register(Arc::new(AmdDevice));
        registry.register(Arc::new(CambriconDevice::new(config)));
        registry.register(Arc::new(EnflameDevice::new(config)));
        registry.register(Arc::new(KunlunDevice));
        registry
    }

    /// Registry restricted to the named vendors
    pub fn with_vendors(config: &DeviceConfig, vendors: &[String]) -> Result<Self> {
        let all = Self::with_defaults(config);
        let mut registry = Self::new();
        for vendor in vendors {
            registry.register(all.get(vendor)?.clone());
        }
        Ok(registry)
    }

    pub fn register(&mut self, device: Arc<dyn Device>) {
        info!(vendor = device.vendor(), "Registered device vendor");
        self.devices.insert(device.vendor(), device);
    }

    pub fn get(&self, vendor: &str) -> Result<&Arc<dyn Device>> {
        self.devices
            .get(vendor)
            .ok_or_else(|| DeviceError::unknown_vendor(vendor))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Device>> {
        self.devices.values()
    }

    pub fn vendors(&self) -> Vec<&'static str> {
        self.devices.keys().copied().collect()
    }

    /// Per-container device requests of a pod, index-aligned with its containers
    pub fn pod_requests(&self, pod: &Pod) -> Result<PodDeviceRequests> {
        let annotations = pod.annotations();
        let mut requests = PodDeviceRequests::new();
        for container in pod.containers() {
            let mut per_vendor = ContainerDeviceRequests::new();
            for device in self.iter() {
                if let Some(req) = device.generate_resource_request(container, &annotations)? {
                    per_vendor.insert(device.vendor().to_string(), req);
                }
            }
            requests.push(per_vendor);
        }
        Ok(requests)
    }

    /// Vendor to allocated-grant annotation key
    pub fn allocated_keys(&self) -> BTreeMap<String, String> {
        self.iter()
            .map(|d| (d.vendor().to_string(), d.keys().allocated.to_string()))
            .collect()
    }

    /// Grants recorded in a pod's annotations, across all vendors
    pub fn decode_pod_devices(&self, annotations: &BTreeMap<String, String>) -> Result<PodDevices> {
        Ok(codec::decode_pod_devices(&self.allocated_keys(), annotations)?)
    }

    /// Annotation patch carrying every vendor's grants
    pub fn patch_annotations(
        &self,
        annotations: &mut BTreeMap<String, String>,
        devices: &PodDevices,
    ) -> Result<()> {
        for device in self.iter() {
            device.patch_annotations(annotations, devices)?;
        }
        Ok(())
    }

    /// Quota resource names per vendor, with the MiB per unit of each
    pub fn quota_resources(&self) -> Vec<QuotaResource> {
        let mut out = Vec::new();
        for device in self.iter() {
            let names = device.resource_names();
            if let Some(memory) = names.memory {
                out.push(QuotaResource {
                    vendor: device.vendor(),
                    name: memory,
                    kind: QuotaKind::Memory {
                        unit: device.memory_unit().max(1),
                    },
                });
            }
            if let Some(cores) = names.cores {
                out.push(QuotaResource {
                    vendor: device.vendor(),
                    name: cores,
                    kind: QuotaKind::Cores,
                });
            }
        }
        out
    }
}

/// A device resource that namespaces can put a hard limit on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaResource {
    pub vendor: &'static str,
    pub name: &'static str,
    pub kind: QuotaKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    /// Granted memory, counted in units of `unit` MiB
    Memory { unit: u64 },
    /// Granted core percentage
    Cores,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("vendors", &self.vendors())
            .finish()
    }
}
