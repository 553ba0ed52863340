//! Device plugin side of a grant: find the next container's devices in the pod
//! annotations, turn them into ids and environment, and mark them handed out.

use crate::error::{DeviceError, Result};
use crate::registry::DeviceRegistry;
use crate::traits::Device;
use gpushare_core::annotations::BIND_PHASE;
use gpushare_core::codec;
use gpushare_core::{BindPhase, ContainerDevices, Pod, PodExt};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// What the device plugin answers for one container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerAllocation {
    /// Device ids to expose
    pub device_ids: Vec<String>,
    pub envs: BTreeMap<String, String>,
}

/// Allocation for vendors that share a device, with per-device limits
///
/// `limit_prefix` yields `<P>_DEVICE_MEMORY_LIMIT_<i>=<mem>m` per device and
/// `<P>_DEVICE_SM_LIMIT=<cores>`.
pub fn sliced_allocation(
    visible_env: &str,
    limit_prefix: &str,
    devices: &ContainerDevices,
) -> ContainerAllocation {
    let device_ids: Vec<String> = devices.iter().map(|d| d.uuid.clone()).collect();
    let mut envs = BTreeMap::new();
    envs.insert(visible_env.to_string(), device_ids.join(","));
    for (i, dev) in devices.iter().enumerate() {
        envs.insert(
            format!("{}_DEVICE_MEMORY_LIMIT_{}", limit_prefix, i),
            format!("{}m", dev.usedmem),
        );
    }
    if let Some(first) = devices.first() {
        if first.usedcores > 0 {
            envs.insert(
                format!("{}_DEVICE_SM_LIMIT", limit_prefix),
                first.usedcores.to_string(),
            );
        }
    }
    ContainerAllocation { device_ids, envs }
}

/// Allocation for vendors that hand out whole devices by index
pub fn whole_allocation(visible_env: &str, devices: &ContainerDevices) -> ContainerAllocation {
    let indices: Vec<String> = devices.iter().map(|d| d.idx.to_string()).collect();
    let mut envs = BTreeMap::new();
    envs.insert(visible_env.to_string(), indices.join(","));
    ContainerAllocation {
        device_ids: devices.iter().map(|d| d.uuid.clone()).collect(),
        envs,
    }
}

/// First container with a non-empty pending grant for `device`
pub fn next_device_request(device: &dyn Device, pod: &Pod) -> Result<(usize, ContainerDevices)> {
    let key = device.keys().to_allocate;
    let annotations = pod.annotations();
    let value = annotations
        .get(key)
        .ok_or_else(|| DeviceError::allocation_not_found(pod.key(), device.vendor()))?;
    let pending = codec::decode_pod_single_device(key, value)?;
    pending
        .into_iter()
        .enumerate()
        .find(|(_, devices)| !devices.is_empty())
        .ok_or_else(|| DeviceError::allocation_not_found(pod.key(), device.vendor()))
}

/// Pending-grant annotation with the next container's entry emptied
pub fn erase_next_device_request(
    device: &dyn Device,
    pod: &Pod,
) -> Result<BTreeMap<String, String>> {
    let key = device.keys().to_allocate;
    let annotations = pod.annotations();
    let value = annotations
        .get(key)
        .ok_or_else(|| DeviceError::allocation_not_found(pod.key(), device.vendor()))?;
    let mut pending = codec::decode_pod_single_device(key, value)?;
    let next = pending
        .iter_mut()
        .find(|devices| !devices.is_empty())
        .ok_or_else(|| DeviceError::allocation_not_found(pod.key(), device.vendor()))?;
    next.clear();

    let mut patch = BTreeMap::new();
    patch.insert(key.to_string(), codec::encode_pod_single_device(&pending)?);
    Ok(patch)
}

/// Whether every vendor's pending grant in `annotations` has been handed out
pub fn pod_allocation_done(
    registry: &DeviceRegistry,
    annotations: &BTreeMap<String, String>,
) -> Result<bool> {
    for device in registry.iter() {
        let key = device.keys().to_allocate;
        if let Some(value) = annotations.get(key) {
            let pending = codec::decode_pod_single_device(key, value)?;
            if pending.iter().any(|devices| !devices.is_empty()) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Result of a device plugin Allocate call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginAllocation {
    /// Container index in the pod spec
    pub container: usize,
    pub allocation: ContainerAllocation,
    /// Annotations to merge into the pod
    pub annotations: BTreeMap<String, String>,
}

/// Hand out the next pending container grant of `vendor` for `pod`
///
/// When this empties the last pending grant across all vendors the patch also
/// sets the bind phase to success.
pub fn allocate(registry: &DeviceRegistry, vendor: &str, pod: &Pod) -> Result<PluginAllocation> {
    let device = registry.get(vendor)?;
    let (container, devices) = next_device_request(device.as_ref(), pod)?;
    let allocation = device.container_allocation(&devices);
    let mut patch = erase_next_device_request(device.as_ref(), pod)?;

    let mut merged = pod.annotations();
    merged.extend(patch.clone());
    if pod_allocation_done(registry, &merged)? {
        patch.insert(BIND_PHASE.to_string(), BindPhase::Success.to_string());
    }

    debug!(
        pod = %pod.key(),
        vendor,
        container,
        devices = devices.len(),
        "Allocated container devices"
    );
    Ok(PluginAllocation {
        container,
        allocation,
        annotations: patch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::nvidia::NVIDIA;
    use gpushare_core::{ContainerDevice, ObjectMeta, PodSingleDevice};

    fn grant(uuid: &str, idx: u32, mem: u64, cores: u32) -> ContainerDevice {
        ContainerDevice {
            idx,
            uuid: uuid.to_string(),
            device_type: "NVIDIA-Tesla T4".to_string(),
            usedmem: mem,
            usedcores: cores,
        }
    }

    fn pod_with(annotations: BTreeMap<String, String>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("job".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pending_pod(registry: &DeviceRegistry, single: PodSingleDevice) -> Pod {
        let device = registry.get(NVIDIA).unwrap();
        let mut annotations = BTreeMap::new();
        annotations.insert(
            device.keys().to_allocate.to_string(),
            codec::encode_pod_single_device(&single).unwrap(),
        );
        pod_with(annotations)
    }

    #[test]
    fn test_sliced_allocation_env() {
        let devices = vec![grant("GPU-a", 0, 1000, 30), grant("GPU-b", 1, 2000, 30)];
        let alloc = sliced_allocation("NVIDIA_VISIBLE_DEVICES", "CUDA", &devices);
        assert_eq!(alloc.device_ids, vec!["GPU-a", "GPU-b"]);
        assert_eq!(alloc.envs["NVIDIA_VISIBLE_DEVICES"], "GPU-a,GPU-b");
        assert_eq!(alloc.envs["CUDA_DEVICE_MEMORY_LIMIT_0"], "1000m");
        assert_eq!(alloc.envs["CUDA_DEVICE_MEMORY_LIMIT_1"], "2000m");
        assert_eq!(alloc.envs["CUDA_DEVICE_SM_LIMIT"], "30");
    }

    #[test]
    fn test_whole_allocation_uses_indices() {
        let devices = vec![grant("XPU-4", 4, 0, 100), grant("XPU-6", 6, 0, 100)];
        let alloc = whole_allocation("XPU_VISIBLE_DEVICES", &devices);
        assert_eq!(alloc.envs["XPU_VISIBLE_DEVICES"], "4,6");
        assert_eq!(alloc.device_ids.len(), 2);
    }

    #[test]
    fn test_allocate_walks_containers_in_order() {
        let registry = DeviceRegistry::with_defaults(&DeviceConfig::default());
        let pod = pending_pod(
            &registry,
            vec![vec![], vec![grant("GPU-a", 0, 1000, 30)], vec![grant("GPU-b", 1, 500, 0)]],
        );

        let first = allocate(&registry, NVIDIA, &pod).unwrap();
        assert_eq!(first.container, 1);
        assert_eq!(first.allocation.device_ids, vec!["GPU-a"]);
        assert!(!first.annotations.contains_key(BIND_PHASE));

        let mut annotations = pod.annotations();
        annotations.extend(first.annotations);
        let pod = pod_with(annotations);

        let second = allocate(&registry, NVIDIA, &pod).unwrap();
        assert_eq!(second.container, 2);
        assert_eq!(second.annotations[BIND_PHASE], "success");

        let mut annotations = pod.annotations();
        annotations.extend(second.annotations);
        let pod = pod_with(annotations);
        assert!(matches!(
            allocate(&registry, NVIDIA, &pod),
            Err(DeviceError::AllocationNotFound { .. })
        ));
    }

    #[test]
    fn test_missing_grant() {
        let registry = DeviceRegistry::with_defaults(&DeviceConfig::default());
        let pod = pod_with(BTreeMap::new());
        assert!(next_device_request(registry.get(NVIDIA).unwrap().as_ref(), &pod).is_err());
        assert!(pod_allocation_done(&registry, &BTreeMap::new()).unwrap());
    }
}
