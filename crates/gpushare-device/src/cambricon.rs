//! Cambricon MLUs shared by virtual memory units and virtual cores.

use crate::allocate::{sliced_allocation, ContainerAllocation};
use crate::checks;
use crate::config::DeviceConfig;
use crate::error::Result;
use crate::fit::{fit_slices, FitFailure};
use crate::request::Limits;
use crate::traits::{Device, FitContext, ResourceNames, Sealed, VendorKeys};
use gpushare_core::{Container, ContainerDeviceRequest, ContainerDevices, DeviceUsage, MEM_PERCENTAGE_ABSOLUTE};
use std::collections::BTreeMap;

pub const CAMBRICON: &str = "MLU";

pub const USE_MLU_TYPE: &str = "cambricon.com/use-mlutype";
pub const NOUSE_MLU_TYPE: &str = "cambricon.com/nouse-mlutype";

const RESOURCES: ResourceNames = ResourceNames {
    count: "cambricon.com/vmlu",
    memory: Some("cambricon.com/mlu.smlu.vmemory"),
    memory_percentage: None,
    cores: Some("cambricon.com/mlu.smlu.vcore"),
};

const KEYS: VendorKeys = VendorKeys {
    register: "gpushare.io/node-mlu-register",
    handshake: "gpushare.io/node-handshake-mlu",
    to_allocate: "gpushare.io/mlu-devices-to-allocate",
    allocated: "gpushare.io/mlu-devices-allocated",
    use_uuid: "cambricon.com/use-mluuuid",
    nouse_uuid: "cambricon.com/nouse-mluuuid",
};

pub struct CambriconDevice {
    config: DeviceConfig,
}

impl CambriconDevice {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl Sealed for CambriconDevice {}

impl Device for CambriconDevice {
    fn vendor(&self) -> &'static str {
        CAMBRICON
    }

    fn resource_names(&self) -> &ResourceNames {
        &RESOURCES
    }

    fn keys(&self) -> &VendorKeys {
        &KEYS
    }

    fn memory_unit(&self) -> u64 {
        self.config.mlu_memory_unit
    }

    fn generate_resource_request(
        &self,
        container: &Container,
        _annotations: &BTreeMap<String, String>,
    ) -> Result<Option<ContainerDeviceRequest>> {
        let limits = Limits::new(container);
        let count = limits.count(RESOURCES.count)?;
        let memory = limits.get(RESOURCES.memory)?;
        let cores = limits.percentage(RESOURCES.cores)?;

        let nums = match count {
            Some(n) => n,
            None if memory.is_some() || cores.is_some() => self.config.default_count,
            None => return Ok(None),
        };
        if nums == 0 {
            return Ok(None);
        }

        let (memreq, mem_percentage_req) = match memory {
            Some(units) if units > 0 => (
                units.saturating_mul(self.config.mlu_memory_unit),
                MEM_PERCENTAGE_ABSOLUTE,
            ),
            _ => (0, 100),
        };

        Ok(Some(ContainerDeviceRequest {
            device_type: CAMBRICON.to_string(),
            nums,
            memreq,
            mem_percentage_req,
            coresreq: cores.unwrap_or(self.config.default_cores),
            numa: false,
        }))
    }

    fn check_type(
        &self,
        annotations: &BTreeMap<String, String>,
        device: &DeviceUsage,
        request: &ContainerDeviceRequest,
    ) -> (bool, bool) {
        let found = request.device_type == CAMBRICON
            && device.vendor == CAMBRICON
            && checks::type_allowed(annotations, USE_MLU_TYPE, NOUSE_MLU_TYPE, &device.device_type);
        (found, false)
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
        sliced_allocation("CAMBRICON_VISIBLE_DEVICES", "CAMBRICON", devices)
    }
}
