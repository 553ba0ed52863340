use crate::score::{node_score, sort_devices};
use crate::types::NodeScore;
use gpushare_core::{NodeUsage, PodDeviceRequests, PodDevices, SchedulerPolicy};
use gpushare_device::{DeviceRegistry, FitContext, FitFailure, FitReason};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use tracing::debug;

/// Fit every container of a pod onto one node
///
/// Works on a private copy of the node's devices: each container's grant is
/// applied to the copy before the next container is fitted, so one pod never
/// over-commits a device. Nothing is written back to the node.
pub fn fit_pod_on_node(
    registry: &DeviceRegistry,
    node: &NodeUsage,
    requests: &PodDeviceRequests,
    annotations: &BTreeMap<String, String>,
    gpu_policy: SchedulerPolicy,
) -> Result<NodeScore, FitFailure> {
    let mut usage = node.devices.clone();
    let vendors: BTreeSet<&str> = requests
        .iter()
        .flat_map(|ctr| ctr.keys().map(String::as_str))
        .collect();

    let mut allocated = PodDevices::new();
    for vendor in &vendors {
        allocated.insert(vendor.to_string(), vec![Vec::new(); requests.len()]);
    }

    for (index, container) in requests.iter().enumerate() {
        for (vendor, request) in container {
            let Ok(device) = registry.get(vendor) else {
                return Err(FitFailure::single(FitReason::CardTypeMismatch, usage.len()));
            };

            let mut candidates: Vec<_> = usage
                .iter()
                .filter(|d| d.vendor == *vendor)
                .cloned()
                .collect();
            if candidates.len() < request.nums as usize {
                debug!(
                    node = %node.id,
                    vendor = %vendor,
                    have = candidates.len(),
                    want = request.nums,
                    "Node has too few devices"
                );
                return Err(FitFailure::single(
                    FitReason::NodeInsufficientDevice,
                    candidates.len(),
                ));
            }
            sort_devices(&mut candidates, request, gpu_policy);

            let ctx = FitContext {
                annotations,
                node: &node.id,
            };
            let granted = device.fit(&candidates, request, &ctx).inspect_err(|failure| {
                debug!(node = %node.id, container = index, reason = %failure, "Container does not fit");
            })?;

            for grant in &granted {
                if let Some(dev) = usage.iter_mut().find(|d| d.id == grant.uuid) {
                    dev.add_usage(grant);
                }
            }
            if let Some(containers) = allocated.get_mut(vendor) {
                containers[index] = granted;
            }
        }
    }

    let touched: Vec<_> = usage
        .into_iter()
        .filter(|d| vendors.contains(d.vendor.as_str()))
        .collect();
    Ok(NodeScore {
        node_id: node.id.clone(),
        devices: allocated,
        score: node_score(&touched),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpushare_core::{ContainerDeviceRequest, ContainerDeviceRequests, DeviceUsage, Node, MEM_PERCENTAGE_ABSOLUTE};
    use gpushare_device::DeviceConfig;
    use std::sync::Arc;

    fn node(devices: Vec<DeviceUsage>) -> NodeUsage {
        NodeUsage {
            id: "node-a".to_string(),
            node: Arc::new(Node::default()),
            devices,
        }
    }

    fn gpu(index: u32) -> DeviceUsage {
        DeviceUsage {
            id: format!("GPU-{}", index),
            index,
            vendor: "NVIDIA".to_string(),
            device_type: "NVIDIA-Tesla T4".to_string(),
            numa: 0,
            health: true,
            count: 10,
            totalmem: 8000,
            totalcore: 100,
            used: 0,
            usedmem: 0,
            usedcores: 0,
        }
    }

    fn ask(nums: u32, memreq: u64, coresreq: u32) -> ContainerDeviceRequests {
        let mut reqs = ContainerDeviceRequests::new();
        reqs.insert(
            "NVIDIA".to_string(),
            ContainerDeviceRequest {
                device_type: "NVIDIA".to_string(),
                nums,
                memreq,
                mem_percentage_req: MEM_PERCENTAGE_ABSOLUTE,
                coresreq,
                numa: false,
            },
        );
        reqs
    }

    fn run(
        node: &NodeUsage,
        requests: &PodDeviceRequests,
        policy: SchedulerPolicy,
    ) -> Result<NodeScore, FitFailure> {
        let registry = DeviceRegistry::with_defaults(&DeviceConfig::default());
        fit_pod_on_node(&registry, node, requests, &BTreeMap::new(), policy)
    }

    #[test]
    fn test_binpack_single_container() {
        let node = node(vec![gpu(0), gpu(1)]);
        let fit = run(&node, &vec![ask(1, 1000, 30)], SchedulerPolicy::Binpack).unwrap();
        let grant = &fit.devices["NVIDIA"][0][0];
        assert_eq!(grant.idx, 1);
        assert_eq!(grant.usedmem, 1000);
        assert_eq!(grant.usedcores, 30);
        // 1/10 + 30/100 + 1000/8000
        assert!((fit.score - 5.25).abs() < 1e-9);
    }

    #[test]
    fn test_binpack_stacks_containers_on_one_device() {
        let node = node(vec![gpu(0), gpu(1)]);
        let requests = vec![ask(1, 1000, 30), ContainerDeviceRequests::new(), ask(1, 1000, 30)];
        let fit = run(&node, &requests, SchedulerPolicy::Binpack).unwrap();
        let containers = &fit.devices["NVIDIA"];
        assert_eq!(containers.len(), 3);
        assert!(containers[1].is_empty());
        assert_eq!(containers[0][0].uuid, containers[2][0].uuid);
    }

    #[test]
    fn test_spread_separates_containers() {
        let node = node(vec![gpu(0), gpu(1)]);
        let requests = vec![ask(1, 1000, 30), ask(1, 1000, 30)];
        let fit = run(&node, &requests, SchedulerPolicy::Spread).unwrap();
        let containers = &fit.devices["NVIDIA"];
        assert_ne!(containers[0][0].uuid, containers[1][0].uuid);
    }

    #[test]
    fn test_later_container_sees_earlier_grants() {
        let node = node(vec![gpu(0)]);
        let requests = vec![ask(1, 5000, 0), ask(1, 5000, 0)];
        let failure = run(&node, &requests, SchedulerPolicy::Binpack).unwrap_err();
        assert_eq!(failure.to_string(), "1/1 CardInsufficientMemory");
    }

    #[test]
    fn test_too_few_devices() {
        let node = node(vec![gpu(0)]);
        let failure = run(&node, &vec![ask(2, 1000, 0)], SchedulerPolicy::Binpack).unwrap_err();
        assert_eq!(failure.to_string(), "1/1 NodeInsufficientDevice");
    }

    #[test]
    fn test_snapshot_is_not_mutated() {
        let node = node(vec![gpu(0), gpu(1)]);
        run(&node, &vec![ask(2, 1000, 30)], SchedulerPolicy::Binpack).unwrap();
        assert!(node.devices.iter().all(|d| d.used == 0));
    }
}
