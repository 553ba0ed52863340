use k8s_openapi::api::core::v1::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// `mem_percentage_req` value meaning "ignore the percentage, `memreq` is authoritative"
pub const MEM_PERCENTAGE_ABSOLUTE: u32 = 101;

/// Core percentage that asks for a device exclusively
pub const EXCLUSIVE_CORES: u32 = 100;

/// Static description of one physical device, as reported by a device plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable device identifier (UUID)
    pub id: String,
    /// Position of the device on its node
    pub index: u32,
    /// Vendor key the device was registered under (e.g. "NVIDIA")
    pub vendor: String,
    /// Card model, e.g. "NVIDIA-Tesla T4"
    pub device_type: String,
    /// Number of virtual slots (time-slicing share count)
    pub count: u32,
    /// Total device memory in MiB
    pub devmem: u64,
    /// Total core percentage, normally 100
    pub devcore: u32,
    /// NUMA node the device is attached to
    pub numa: i32,
    /// Health flag, the only field that changes after discovery
    pub health: bool,
}

/// Live usage of one device: static capacity plus counters
///
/// Invariant: `used <= count`, `usedmem <= totalmem`, `usedcores <= totalcore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUsage {
    pub id: String,
    pub index: u32,
    pub vendor: String,
    pub device_type: String,
    pub numa: i32,
    pub health: bool,
    pub count: u32,
    pub totalmem: u64,
    pub totalcore: u32,
    /// Slots consumed
    pub used: u32,
    /// Memory consumed in MiB
    pub usedmem: u64,
    /// Core percentage consumed
    pub usedcores: u32,
}

impl DeviceUsage {
    /// Create an idle usage entry for a discovered device
    pub fn from_info(info: &DeviceInfo) -> Self {
        Self {
            id: info.id.clone(),
            index: info.index,
            vendor: info.vendor.clone(),
            device_type: info.device_type.clone(),
            numa: info.numa,
            health: info.health,
            count: info.count,
            totalmem: info.devmem,
            totalcore: info.devcore,
            used: 0,
            usedmem: 0,
            usedcores: 0,
        }
    }

    /// Remaining memory in MiB
    pub fn free_mem(&self) -> u64 {
        self.totalmem.saturating_sub(self.usedmem)
    }

    /// Remaining core percentage
    pub fn free_cores(&self) -> u32 {
        self.totalcore.saturating_sub(self.usedcores)
    }

    /// Whether another slot can still be handed out
    pub fn has_free_slot(&self) -> bool {
        self.used < self.count
    }

    /// Whether one more grant of `mem`/`cores` keeps the device within capacity
    pub fn can_hold(&self, mem: u64, cores: u32) -> bool {
        self.has_free_slot() && mem <= self.free_mem() && cores <= self.free_cores()
    }

    /// Apply one granted slot to the counters, clamping at the integer limit
    pub fn add_usage(&mut self, device: &ContainerDevice) {
        self.used = self.used.saturating_add(1);
        self.usedmem = self.usedmem.saturating_add(device.usedmem);
        self.usedcores = self.usedcores.saturating_add(device.usedcores);
    }

    /// Return one granted slot, clamping at zero
    pub fn remove_usage(&mut self, device: &ContainerDevice) {
        self.used = self.used.saturating_sub(1);
        self.usedmem = self.usedmem.saturating_sub(device.usedmem);
        self.usedcores = self.usedcores.saturating_sub(device.usedcores);
    }
}

/// Normalized device ask of one container for one vendor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDeviceRequest {
    /// Vendor key the request targets
    pub device_type: String,
    /// Number of devices
    pub nums: u32,
    /// Absolute memory per device in MiB
    pub memreq: u64,
    /// Memory as a percentage of the card, or [`MEM_PERCENTAGE_ABSOLUTE`]
    pub mem_percentage_req: u32,
    /// Core percentage per device
    pub coresreq: u32,
    /// Devices of one container must share a NUMA node
    pub numa: bool,
}

impl ContainerDeviceRequest {
    /// A request for 100% of the cores conflicts with any other user of the device
    pub fn is_exclusive(&self) -> bool {
        self.coresreq == EXCLUSIVE_CORES
    }

    /// Memory this request takes from a device with `totalmem` MiB
    pub fn memory_on(&self, totalmem: u64) -> u64 {
        if self.memreq > 0 {
            self.memreq
        } else if self.mem_percentage_req != MEM_PERCENTAGE_ABSOLUTE {
            totalmem * u64::from(self.mem_percentage_req) / 100
        } else {
            0
        }
    }
}

/// Per-vendor requests of one container
pub type ContainerDeviceRequests = BTreeMap<String, ContainerDeviceRequest>;

/// Requests of every container of a pod, index-aligned with the pod spec
pub type PodDeviceRequests = Vec<ContainerDeviceRequests>;

/// Total number of devices a pod asks for
pub fn total_requested(requests: &PodDeviceRequests) -> u64 {
    requests
        .iter()
        .flat_map(|ctr| ctr.values())
        .map(|req| u64::from(req.nums))
        .sum()
}

/// One device granted to a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDevice {
    pub idx: u32,
    pub uuid: String,
    pub device_type: String,
    pub usedmem: u64,
    pub usedcores: u32,
}

/// Devices granted to one container for one vendor
pub type ContainerDevices = Vec<ContainerDevice>;

/// Per-container grants of one vendor, index-aligned with the pod containers
pub type PodSingleDevice = Vec<ContainerDevices>;

/// Vendor key to per-container grants
pub type PodDevices = BTreeMap<String, PodSingleDevice>;

/// Iterate over every device granted in a pod
pub fn pod_devices_iter(devices: &PodDevices) -> impl Iterator<Item = &ContainerDevice> {
    devices.values().flatten().flatten()
}

/// Node as registered by device plugins: identity plus discovered devices
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: String,
    pub node: Arc<Node>,
    pub devices: Vec<DeviceInfo>,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>, node: Arc<Node>, devices: Vec<DeviceInfo>) -> Self {
        Self {
            id: id.into(),
            node,
            devices,
        }
    }
}

/// Live view of a node's devices
#[derive(Debug, Clone, Serialize)]
pub struct NodeUsage {
    pub id: String,
    #[serde(skip)]
    pub node: Arc<Node>,
    pub devices: Vec<DeviceUsage>,
}

impl NodeUsage {
    /// Devices registered by one vendor
    pub fn vendor_devices(&self, vendor: &str) -> Vec<DeviceUsage> {
        self.devices
            .iter()
            .filter(|d| d.vendor == vendor)
            .cloned()
            .collect()
    }

    /// Find a device by UUID
    pub fn device_mut(&mut self, uuid: &str) -> Option<&mut DeviceUsage> {
        self.devices.iter_mut().find(|d| d.id == uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> DeviceInfo {
        DeviceInfo {
            id: id.to_string(),
            index: 0,
            vendor: "NVIDIA".to_string(),
            device_type: "NVIDIA-Tesla T4".to_string(),
            count: 10,
            devmem: 8000,
            devcore: 100,
            numa: 0,
            health: true,
        }
    }

    #[test]
    fn test_usage_counters() {
        let mut usage = DeviceUsage::from_info(&info("gpu-0"));
        assert!(usage.can_hold(8000, 100));

        let grant = ContainerDevice {
            idx: 0,
            uuid: "gpu-0".to_string(),
            device_type: "NVIDIA".to_string(),
            usedmem: 3000,
            usedcores: 30,
        };
        usage.add_usage(&grant);
        assert_eq!(usage.used, 1);
        assert_eq!(usage.free_mem(), 5000);
        assert_eq!(usage.free_cores(), 70);
        assert!(!usage.can_hold(6000, 0));

        usage.remove_usage(&grant);
        assert_eq!(usage, DeviceUsage::from_info(&info("gpu-0")));
    }

    #[test]
    fn test_usage_counters_saturate() {
        let mut usage = DeviceUsage::from_info(&info("gpu-0"));
        let corrupt = ContainerDevice {
            idx: 0,
            uuid: "gpu-0".to_string(),
            device_type: "NVIDIA".to_string(),
            usedmem: u64::MAX,
            usedcores: u32::MAX,
        };
        usage.add_usage(&corrupt);
        usage.add_usage(&corrupt);
        assert_eq!(usage.usedmem, u64::MAX);
        assert_eq!(usage.usedcores, u32::MAX);
        assert_eq!(usage.used, 2);
        assert!(!usage.can_hold(1, 0));
    }

    #[test]
    fn test_memory_on() {
        let mut req = ContainerDeviceRequest {
            device_type: "NVIDIA".to_string(),
            nums: 1,
            memreq: 0,
            mem_percentage_req: 50,
            coresreq: 0,
            numa: false,
        };
        assert_eq!(req.memory_on(8000), 4000);

        req.memreq = 1000;
        assert_eq!(req.memory_on(8000), 1000);

        req.memreq = 0;
        req.mem_percentage_req = MEM_PERCENTAGE_ABSOLUTE;
        assert_eq!(req.memory_on(8000), 0);
    }

    #[test]
    fn test_total_requested() {
        let mut ctr = ContainerDeviceRequests::new();
        ctr.insert(
            "NVIDIA".to_string(),
            ContainerDeviceRequest {
                device_type: "NVIDIA".to_string(),
                nums: 2,
                memreq: 0,
                mem_percentage_req: 100,
                coresreq: 0,
                numa: false,
            },
        );
        let requests = vec![ctr.clone(), ContainerDeviceRequests::new()];
        assert_eq!(total_requested(&requests), 2);

        // Counts past u32::MAX neither wrap nor overflow
        let mut huge = ctr.clone();
        huge.get_mut("NVIDIA").unwrap().nums = u32::MAX;
        let mut one = ctr;
        one.get_mut("NVIDIA").unwrap().nums = 1;
        assert_eq!(total_requested(&vec![huge, one]), u64::from(u32::MAX) + 1);
    }
}
