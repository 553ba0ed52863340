//! Shared fit loop for vendors that slice devices by memory and cores.

use crate::traits::{Device, FitContext};
use gpushare_core::{ContainerDevice, ContainerDeviceRequest, ContainerDevices, DeviceUsage, EXCLUSIVE_CORES};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::trace;

/// Why a device or node was rejected
///
/// Declaration order is the order reasons are rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum FitReason {
    CardTypeMismatch,
    CardUuidMismatch,
    CardUnhealthy,
    CardTimeSlicingExhausted,
    CardInsufficientMemory,
    CardInsufficientCore,
    ExclusiveDeviceAllocateConflict,
    CardComputeUnitsExhausted,
    NumaNotFit,
    CardTopologyMismatch,
    AllocatedCardsInsufficientRequest,
    NodeInsufficientDevice,
    ResourceQuotaNotFit,
}

impl fmt::Display for FitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Multiset of rejection reasons
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FitReasons {
    counts: BTreeMap<FitReason, usize>,
}

impl FitReasons {
    pub fn add(&mut self, reason: FitReason) {
        self.add_n(reason, 1);
    }

    pub fn add_n(&mut self, reason: FitReason, n: usize) {
        if n > 0 {
            *self.counts.entry(reason).or_default() += n;
        }
    }

    pub fn count(&self, reason: FitReason) -> usize {
        self.counts.get(&reason).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Render as `"<cnt>/<total> <Reason>"` entries joined by `", "`
    pub fn render(&self, total: usize) -> String {
        self.counts
            .iter()
            .map(|(reason, cnt)| format!("{}/{} {}", cnt, total, reason))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A container request that could not be placed on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitFailure {
    pub reasons: FitReasons,
    /// Devices that were considered
    pub candidates: usize,
}

impl FitFailure {
    pub fn new(reasons: FitReasons, candidates: usize) -> Self {
        Self {
            reasons,
            candidates,
        }
    }

    /// Failure with a single reason counted once per candidate
    pub fn single(reason: FitReason, candidates: usize) -> Self {
        let mut reasons = FitReasons::default();
        reasons.add_n(reason, candidates.max(1));
        Self::new(reasons, candidates.max(1))
    }
}

impl fmt::Display for FitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reasons.render(self.candidates))
    }
}

/// Scan `devices` from the end and take the first `request.nums` that fit
///
/// The caller orders `devices` by device policy so the preferred device sits
/// last. A NUMA-bound request restarts its selection whenever the scan moves
/// to another NUMA node.
pub fn fit_slices<D: Device + ?Sized>(
    vendor: &D,
    devices: &[DeviceUsage],
    request: &ContainerDeviceRequest,
    ctx: &FitContext<'_>,
) -> Result<ContainerDevices, FitFailure> {
    let mut picked = ContainerDevices::new();
    if request.nums == 0 {
        return Ok(picked);
    }

    let coresreq = request.coresreq.min(EXCLUSIVE_CORES);
    let mut remaining = request.nums;
    let mut prev_numa: Option<i32> = None;
    let mut reasons = FitReasons::default();

    for dev in devices.iter().rev() {
        let (found, numa) = vendor.check_type(ctx.annotations, dev, request);
        if !found {
            reasons.add(FitReason::CardTypeMismatch);
            continue;
        }
        if numa && prev_numa != Some(dev.numa) {
            reasons.add_n(FitReason::NumaNotFit, picked.len());
            picked.clear();
            remaining = request.nums;
            prev_numa = Some(dev.numa);
        }
        if !vendor.check_uuid(ctx.annotations, dev) {
            reasons.add(FitReason::CardUuidMismatch);
            continue;
        }
        if !dev.health {
            reasons.add(FitReason::CardUnhealthy);
            continue;
        }
        if !dev.has_free_slot() {
            reasons.add(FitReason::CardTimeSlicingExhausted);
            continue;
        }

        let memreq = request.memory_on(dev.totalmem);
        if dev.free_mem() < memreq {
            reasons.add(FitReason::CardInsufficientMemory);
            continue;
        }
        if dev.free_cores() < coresreq {
            reasons.add(FitReason::CardInsufficientCore);
            continue;
        }
        if coresreq == EXCLUSIVE_CORES && dev.used > 0 {
            reasons.add(FitReason::ExclusiveDeviceAllocateConflict);
            continue;
        }
        if dev.totalcore != 0 && dev.usedcores == dev.totalcore && coresreq == 0 {
            reasons.add(FitReason::CardComputeUnitsExhausted);
            continue;
        }

        trace!(node = ctx.node, device = %dev.id, memreq, coresreq, "device fits");
        picked.push(ContainerDevice {
            idx: dev.index,
            uuid: dev.id.clone(),
            device_type: dev.device_type.clone(),
            usedmem: memreq,
            usedcores: coresreq,
        });
        remaining -= 1;
        if remaining == 0 {
            return Ok(picked);
        }
    }

    reasons.add_n(FitReason::AllocatedCardsInsufficientRequest, picked.len());
    Err(FitFailure::new(reasons, devices.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_in_declaration_order() {
        let mut reasons = FitReasons::default();
        reasons.add(FitReason::CardInsufficientCore);
        reasons.add(FitReason::CardTypeMismatch);
        reasons.add_n(FitReason::CardInsufficientMemory, 2);
        reasons.add_n(FitReason::NumaNotFit, 0);
        assert_eq!(
            reasons.render(4),
            "1/4 CardTypeMismatch, 2/4 CardInsufficientMemory, 1/4 CardInsufficientCore"
        );
        assert_eq!(reasons.count(FitReason::NumaNotFit), 0);
    }

    #[test]
    fn test_single_failure() {
        let failure = FitFailure::single(FitReason::NodeInsufficientDevice, 0);
        assert_eq!(failure.to_string(), "1/1 NodeInsufficientDevice");
    }
}
