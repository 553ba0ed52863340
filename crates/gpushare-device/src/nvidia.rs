//! NVIDIA GPUs shared by memory and SM percentage.

use crate::allocate::{sliced_allocation, ContainerAllocation};
use crate::checks;
use crate::config::DeviceConfig;
use crate::error::Result;
use crate::fit::{fit_slices, FitFailure};
use crate::request::Limits;
use crate::traits::{Device, FitContext, ResourceNames, Sealed, VendorKeys};
use gpushare_core::{
    Container, ContainerDeviceRequest, ContainerDevices, DeviceUsage, MEM_PERCENTAGE_ABSOLUTE,
};
use std::collections::BTreeMap;

pub const NVIDIA: &str = "NVIDIA";

/// Restrict placement to card models containing one of these names
pub const USE_GPU_TYPE: &str = "nvidia.com/use-gputype";
/// Exclude card models containing one of these names
pub const NOUSE_GPU_TYPE: &str = "nvidia.com/nouse-gputype";
/// Keep all devices of a container on one NUMA node
pub const NUMA_BIND: &str = "nvidia.com/numa-bind";

const RESOURCES: ResourceNames = ResourceNames {
    count: "nvidia.com/gpu",
    memory: Some("nvidia.com/gpumem"),
    memory_percentage: Some("nvidia.com/gpumem-percentage"),
    cores: Some("nvidia.com/gpucores"),
};

const KEYS: VendorKeys = VendorKeys {
    register: "gpushare.io/node-nvidia-register",
    handshake: "gpushare.io/node-handshake-nvidia",
    to_allocate: "gpushare.io/vgpu-devices-to-allocate",
    allocated: "gpushare.io/vgpu-devices-allocated",
    use_uuid: "nvidia.com/use-gpuuuid",
    nouse_uuid: "nvidia.com/nouse-gpuuuid",
};

pub struct NvidiaDevice {
    config: DeviceConfig,
}

impl NvidiaDevice {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl Sealed for NvidiaDevice {}

impl Device for NvidiaDevice {
    fn vendor(&self) -> &'static str {
        NVIDIA
    }

    fn resource_names(&self) -> &ResourceNames {
        &RESOURCES
    }

    fn keys(&self) -> &VendorKeys {
        &KEYS
    }

    fn generate_resource_request(
        &self,
        container: &Container,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<ContainerDeviceRequest>> {
        let limits = Limits::new(container);
        let count = limits.count(RESOURCES.count)?;
        let memory = limits.get(RESOURCES.memory)?;
        let percentage = limits.percentage(RESOURCES.memory_percentage)?;
        let cores = limits.percentage(RESOURCES.cores)?;

        let nums = match count {
            Some(n) => n,
            None if memory.is_some() || percentage.is_some() || cores.is_some() => {
                self.config.default_count
            }
            None => return Ok(None),
        };
        if nums == 0 {
            return Ok(None);
        }

        let mut memreq = memory.unwrap_or(0);
        let mut mem_percentage_req = percentage.unwrap_or(MEM_PERCENTAGE_ABSOLUTE);
        if mem_percentage_req == MEM_PERCENTAGE_ABSOLUTE && memreq == 0 {
            if self.config.default_memory != 0 {
                memreq = self.config.default_memory;
            } else {
                mem_percentage_req = 100;
            }
        }

        Ok(Some(ContainerDeviceRequest {
            device_type: NVIDIA.to_string(),
            nums,
            memreq,
            mem_percentage_req,
            coresreq: cores.unwrap_or(self.config.default_cores),
            numa: checks::flag(annotations, NUMA_BIND),
        }))
    }

    fn check_type(
        &self,
        annotations: &BTreeMap<String, String>,
        device: &DeviceUsage,
        request: &ContainerDeviceRequest,
    ) -> (bool, bool) {
        let found = request.device_type == NVIDIA
            && device.vendor == NVIDIA
            && checks::type_allowed(annotations, USE_GPU_TYPE, NOUSE_GPU_TYPE, &device.device_type);
        (found, request.numa)
    }

    fn fit(
        &self,
        devices: &[DeviceUsage],
        request: &ContainerDeviceRequest,
        ctx: &FitContext<'_>,
    ) -> std::result::Result<ContainerDevices, FitFailure> {
        fit_slices(self, devices, request, ctx)
    }

    fn container_allocation(&self, devices: &ContainerDevices) -> ContainerAllocation {
        sliced_allocation("NVIDIA_VISIBLE_DEVICES", "CUDA", devices)
    }
}
