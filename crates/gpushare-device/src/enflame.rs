//! Enflame GCUs shared by a single percentage covering memory and cores.

use crate::allocate::{sliced_allocation, ContainerAllocation};
use crate::config::DeviceConfig;
use crate::error::Result;
use crate::fit::{fit_slices, FitFailure};
use crate::request::Limits;
use crate::traits::{Device, FitContext, ResourceNames, Sealed, VendorKeys};
use gpushare_core::{Container, ContainerDeviceRequest, ContainerDevices, DeviceUsage};
use std::collections::BTreeMap;

pub const ENFLAME: &str = "GCU";

const RESOURCES: ResourceNames = ResourceNames {
    count: "enflame.com/vgcu",
    memory: None,
    memory_percentage: Some("enflame.com/vgcu-percentage"),
    cores: None,
};

const KEYS: VendorKeys = VendorKeys {
    register: "gpushare.io/node-gcu-register",
    handshake: "gpushare.io/node-handshake-gcu",
    to_allocate: "gpushare.io/gcu-devices-to-allocate",
    allocated: "gpushare.io/gcu-devices-allocated",
    use_uuid: "enflame.com/use-gcuuuid",
    nouse_uuid: "enflame.com/nouse-gcuuuid",
};

pub struct EnflameDevice {
    config: DeviceConfig,
}

impl EnflameDevice {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl Sealed for EnflameDevice {}

impl Device for EnflameDevice {
    fn vendor(&self) -> &'static str {
        ENFLAME
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
        _annotations: &BTreeMap<String, String>,
    ) -> Result<Option<ContainerDeviceRequest>> {
        let limits = Limits::new(container);
        let count = limits.count(RESOURCES.count)?;
        let percentage = limits.percentage(RESOURCES.memory_percentage)?;

        let nums = match count {
            Some(n) => n,
            None if percentage.is_some() => self.config.default_count,
            None => return Ok(None),
        };
        if nums == 0 {
            return Ok(None);
        }

        let share = percentage.filter(|p| *p > 0).unwrap_or(100);
        Ok(Some(ContainerDeviceRequest {
            device_type: ENFLAME.to_string(),
            nums,
            memreq: 0,
            mem_percentage_req: share,
            coresreq: share,
            numa: false,
        }))
    }

    fn check_type(
        &self,
        _annotations: &BTreeMap<String, String>,
        device: &DeviceUsage,
        request: &ContainerDeviceRequest,
    ) -> (bool, bool) {
        (request.device_type == ENFLAME && device.vendor == ENFLAME, false)
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
        sliced_allocation("TOPS_VISIBLE_DEVICES", "ENFLAME", devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpushare_core::k8s_openapi::api::core::v1::ResourceRequirements;
    use gpushare_core::k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn container(limits: &[(&str, &str)]) -> Container {
        Container {
            name: "gcu".to_string(),
            resources: Some(ResourceRequirements {
                limits: Some(
                    limits
                        .iter()
                        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_percentage_applies_to_memory_and_cores() {
        let gcu = EnflameDevice::new(&DeviceConfig::default());
        let req = gcu
            .generate_resource_request(&container(&[("enflame.com/vgcu-percentage", "25")]), &BTreeMap::new())
            .unwrap()
            .unwrap();
        assert_eq!(req.nums, 1);
        assert_eq!(req.coresreq, 25);
        assert_eq!(req.memory_on(32768), 8192);
    }

    #[test]
    fn test_fit_fills_by_share() {
        let gcu = EnflameDevice::new(&DeviceConfig::default());
        let req = gcu
            .generate_resource_request(&container(&[("enflame.com/vgcu-percentage", "50")]), &BTreeMap::new())
            .unwrap()
            .unwrap();
        let mut device = DeviceUsage {
            id: "GCU-0".to_string(),
            index: 0,
            vendor: ENFLAME.to_string(),
            device_type: "S60".to_string(),
            numa: 0,
            health: true,
            count: 4,
            totalmem: 32768,
            totalcore: 100,
            used: 1,
            usedmem: 16384,
            usedcores: 50,
        };
        let annotations = BTreeMap::new();
        let ctx = FitContext {
            annotations: &annotations,
            node: "node-a",
        };
        let granted = gcu.fit(std::slice::from_ref(&device), &req, &ctx).unwrap();
        assert_eq!(granted[0].usedmem, 16384);
        assert_eq!(granted[0].usedcores, 50);

        device.used = 2;
        device.usedmem = 32768;
        device.usedcores = 100;
        let failure = gcu.fit(std::slice::from_ref(&device), &req, &ctx).unwrap_err();
        assert_eq!(failure.to_string(), "1/1 CardInsufficientMemory");
    }
}
