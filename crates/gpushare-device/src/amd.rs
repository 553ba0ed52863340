//! AMD GPUs, handed out as whole cards.

use crate::allocate::{whole_allocation, ContainerAllocation};
use crate::error::Result;
use crate::fit::{fit_slices, FitFailure};
use crate::request::Limits;
use crate::traits::{Device, FitContext, ResourceNames, Sealed, VendorKeys};
use gpushare_core::{
    Container, ContainerDeviceRequest, ContainerDevices, DeviceUsage, EXCLUSIVE_CORES,
};
use std::collections::BTreeMap;

pub const AMD: &str = "AMDGPU";

const RESOURCES: ResourceNames = ResourceNames {
    count: "amd.com/gpu",
    memory: None,
    memory_percentage: None,
    cores: None,
};

const KEYS: VendorKeys = VendorKeys {
    register: "gpushare.io/node-amd-register",
    handshake: "gpushare.io/node-handshake-amd",
    to_allocate: "gpushare.io/amd-devices-to-allocate",
    allocated: "gpushare.io/amd-devices-allocated",
    use_uuid: "amd.com/use-gpuuuid",
    nouse_uuid: "amd.com/nouse-gpuuuid",
};

#[derive(Default)]
pub struct AmdDevice;

impl Sealed for AmdDevice {}

impl Device for AmdDevice {
    fn vendor(&self) -> &'static str {
        AMD
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
        match Limits::new(container).count(RESOURCES.count)? {
            Some(nums) if nums > 0 => Ok(Some(ContainerDeviceRequest {
                device_type: AMD.to_string(),
                nums,
                memreq: 0,
                mem_percentage_req: 100,
                coresreq: EXCLUSIVE_CORES,
                numa: false,
            })),
            _ => Ok(None),
        }
    }

    fn check_type(
        &self,
        _annotations: &BTreeMap<String, String>,
        device: &DeviceUsage,
        request: &ContainerDeviceRequest,
    ) -> (bool, bool) {
        (request.device_type == AMD && device.vendor == AMD, false)
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
        whole_allocation("HIP_VISIBLE_DEVICES", devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpushare_core::k8s_openapi::api::core::v1::ResourceRequirements;
    use gpushare_core::k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn card(index: u32, used: u32) -> DeviceUsage {
        DeviceUsage {
            id: format!("amd-{}", index),
            index,
            vendor: AMD.to_string(),
            device_type: "MI210".to_string(),
            numa: 0,
            health: true,
            count: 1,
            totalmem: 65536,
            totalcore: 100,
            used,
            usedmem: if used > 0 { 65536 } else { 0 },
            usedcores: if used > 0 { 100 } else { 0 },
        }
    }

    #[test]
    fn test_whole_card_request() {
        let container = Container {
            name: "main".to_string(),
            resources: Some(ResourceRequirements {
                limits: Some(
                    [("amd.com/gpu".to_string(), Quantity("2".to_string()))]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        };
        let req = AmdDevice
            .generate_resource_request(&container, &BTreeMap::new())
            .unwrap()
            .unwrap();
        assert_eq!(req.nums, 2);
        assert!(req.is_exclusive());
        assert_eq!(req.memory_on(65536), 65536);
    }

    #[test]
    fn test_fit_takes_only_idle_cards() {
        let annotations = BTreeMap::new();
        let ctx = FitContext {
            annotations: &annotations,
            node: "node-a",
        };
        let req = ContainerDeviceRequest {
            device_type: AMD.to_string(),
            nums: 1,
            memreq: 0,
            mem_percentage_req: 100,
            coresreq: EXCLUSIVE_CORES,
            numa: false,
        };

        let granted = AmdDevice
            .fit(&[card(0, 0), card(1, 1)], &req, &ctx)
            .unwrap();
        assert_eq!(granted[0].idx, 0);
        assert_eq!(granted[0].usedmem, 65536);

        let failure = AmdDevice.fit(&[card(0, 1)], &req, &ctx).unwrap_err();
        assert_eq!(failure.to_string(), "1/1 CardTimeSlicingExhausted");
    }
}
