//! Kunlun XPUs, handed out as whole devices in interconnect-linked groups.

pub mod topology;

use crate::allocate::{whole_allocation, ContainerAllocation};
use crate::error::Result;
use crate::fit::{FitFailure, FitReason, FitReasons};
use crate::request::Limits;
use crate::traits::{Device, FitContext, ResourceNames, Sealed, VendorKeys};
use gpushare_core::{
    Container, ContainerDevice, ContainerDeviceRequest, ContainerDevices, DeviceUsage,
    EXCLUSIVE_CORES,
};
use std::collections::BTreeMap;
use topology::BOARD_SIZE;
use tracing::debug;

pub const KUNLUN: &str = "XPU";

const RESOURCES: ResourceNames = ResourceNames {
    count: "kunlunxin.com/xpu",
    memory: None,
    memory_percentage: None,
    cores: None,
};

const KEYS: VendorKeys = VendorKeys {
    register: "gpushare.io/node-kunlun-register",
    handshake: "gpushare.io/node-handshake-kunlun",
    to_allocate: "gpushare.io/kunlun-devices-to-allocate",
    allocated: "gpushare.io/kunlun-devices-allocated",
    use_uuid: "kunlunxin.com/use-xpuuuid",
    nouse_uuid: "kunlunxin.com/nouse-xpuuuid",
};

#[derive(Default)]
pub struct KunlunDevice;

impl Sealed for KunlunDevice {}

impl Device for KunlunDevice {
    fn vendor(&self) -> &'static str {
        KUNLUN
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
                device_type: KUNLUN.to_string(),
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
        (request.device_type == KUNLUN && device.vendor == KUNLUN, false)
    }

    fn fit(
        &self,
        devices: &[DeviceUsage],
        request: &ContainerDeviceRequest,
        ctx: &FitContext<'_>,
    ) -> std::result::Result<ContainerDevices, FitFailure> {
        if request.nums == 0 {
            return Ok(ContainerDevices::new());
        }

        let mut reasons = FitReasons::default();
        let mut board: [Option<&DeviceUsage>; BOARD_SIZE] = [None; BOARD_SIZE];
        for dev in devices {
            if !self.check_type(ctx.annotations, dev, request).0 {
                reasons.add(FitReason::CardTypeMismatch);
            } else if !self.check_uuid(ctx.annotations, dev) {
                reasons.add(FitReason::CardUuidMismatch);
            } else if !dev.health {
                reasons.add(FitReason::CardUnhealthy);
            } else if !dev.has_free_slot() {
                reasons.add(FitReason::CardTimeSlicingExhausted);
            } else if dev.used > 0 {
                reasons.add(FitReason::ExclusiveDeviceAllocateConflict);
            } else if (dev.index as usize) < BOARD_SIZE {
                board[dev.index as usize] = Some(dev);
            } else {
                reasons.add(FitReason::CardTopologyMismatch);
            }
        }

        let free = board.map(|slot| slot.is_some());
        let picked = topology::select(&free, request.nums as usize);
        if picked.is_empty() {
            let idle = free.iter().filter(|f| **f).count();
            reasons.add_n(FitReason::CardTopologyMismatch, idle);
            debug!(node = ctx.node, nums = request.nums, idle, "No linked device group free");
            return Err(FitFailure::new(reasons, devices.len()));
        }

        Ok(picked
            .into_iter()
            .filter_map(|i| board[i])
            .map(|dev| ContainerDevice {
                idx: dev.index,
                uuid: dev.id.clone(),
                device_type: dev.device_type.clone(),
                usedmem: request.memory_on(dev.totalmem),
                usedcores: request.coresreq.min(EXCLUSIVE_CORES),
            })
            .collect())
    }

    fn container_allocation(&self, devices: &ContainerDevices) -> ContainerAllocation {
        whole_allocation("XPU_VISIBLE_DEVICES", devices)
    }
}
