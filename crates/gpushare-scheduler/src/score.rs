use crate::types::NodeScore;
use gpushare_core::{ContainerDeviceRequest, DeviceUsage, SchedulerPolicy};
use std::cmp::Ordering;
use tracing::debug;

/// Weight applied to the summed usage ratios
const SCORE_WEIGHT: f64 = 10.0;

fn ratio(used: f64, total: f64) -> f64 {
    if total > 0.0 {
        used / total
    } else {
        0.0
    }
}

/// Score of a device if `request` were placed on it
pub fn device_score(device: &DeviceUsage, request: &ContainerDeviceRequest) -> f64 {
    let slots = ratio(
        (request.nums + device.used) as f64,
        device.count as f64,
    );
    let cores = ratio(
        (request.coresreq + device.usedcores) as f64,
        device.totalcore as f64,
    );
    let mem = ratio(
        (request.memory_on(device.totalmem) + device.usedmem) as f64,
        device.totalmem as f64,
    );
    SCORE_WEIGHT * (slots + cores + mem)
}

/// Order candidates so the device the policy prefers comes last
///
/// Devices start in ascending index order so the fit scan, which runs from
/// the end, visits equal-score devices highest index first. Binpack orders by
/// ascending score within a NUMA node and puts lower NUMA nodes last; spread
/// orders by descending score and puts higher NUMA nodes last.
pub fn sort_devices(
    devices: &mut [DeviceUsage],
    request: &ContainerDeviceRequest,
    policy: SchedulerPolicy,
) {
    devices.sort_by_key(|d| d.index);
    let mut scored: Vec<(f64, DeviceUsage)> = devices
        .iter()
        .map(|d| (device_score(d, request), d.clone()))
        .collect();
    scored.sort_by(|(sa, a), (sb, b)| match policy {
        SchedulerPolicy::Binpack => {
            if a.numa == b.numa {
                sa.total_cmp(sb)
            } else {
                b.numa.cmp(&a.numa)
            }
        }
        SchedulerPolicy::Spread => {
            if a.numa == b.numa {
                sb.total_cmp(sa)
            } else {
                a.numa.cmp(&b.numa)
            }
        }
    });
    for (slot, (_, dev)) in devices.iter_mut().zip(scored) {
        *slot = dev;
    }
}

/// Aggregate usage ratio of a node's devices
pub fn node_score(devices: &[DeviceUsage]) -> f64 {
    devices
        .iter()
        .map(|d| {
            SCORE_WEIGHT
                * (ratio(d.used as f64, d.count as f64)
                    + ratio(d.usedcores as f64, d.totalcore as f64)
                    + ratio(d.usedmem as f64, d.totalmem as f64))
        })
        .sum()
}

/// Order feasible nodes best first
///
/// Binpack prefers the highest score, spread the lowest. Equal scores fall
/// back to node name.
pub fn rank_nodes(scores: &mut [NodeScore], policy: SchedulerPolicy) {
    scores.sort_by(|a, b| {
        let by_score = match policy {
            SchedulerPolicy::Binpack => b.score.total_cmp(&a.score),
            SchedulerPolicy::Spread => a.score.total_cmp(&b.score),
        };
        match by_score {
            Ordering::Equal => a.node_id.cmp(&b.node_id),
            other => other,
        }
    });
    for s in scores.iter() {
        debug!(node = %s.node_id, score = s.score, %policy, "Ranked node");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpushare_core::{PodDevices, MEM_PERCENTAGE_ABSOLUTE};

    fn gpu(index: u32, numa: i32, used: u32, usedmem: u64) -> DeviceUsage {
        DeviceUsage {
            id: format!("GPU-{}", index),
            index,
            vendor: "NVIDIA".to_string(),
            device_type: "NVIDIA-Tesla T4".to_string(),
            numa,
            health: true,
            count: 10,
            totalmem: 8000,
            totalcore: 100,
            used,
            usedmem,
            usedcores: 0,
        }
    }

    fn request() -> ContainerDeviceRequest {
        ContainerDeviceRequest {
            device_type: "NVIDIA".to_string(),
            nums: 1,
            memreq: 1000,
            mem_percentage_req: MEM_PERCENTAGE_ABSOLUTE,
            coresreq: 30,
            numa: false,
        }
    }

    fn order(devices: &[DeviceUsage]) -> Vec<u32> {
        devices.iter().map(|d| d.index).collect()
    }

    #[test]
    fn test_device_score() {
        let dev = gpu(0, 0, 1, 1000);
        // (1+1)/10 + 30/100 + 2000/8000
        let score = device_score(&dev, &request());
        assert!((score - 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_binpack_puts_busiest_last() {
        let mut devices = vec![gpu(1, 0, 0, 0), gpu(0, 0, 2, 4000), gpu(2, 0, 1, 1000)];
        sort_devices(&mut devices, &request(), SchedulerPolicy::Binpack);
        assert_eq!(order(&devices), vec![1, 2, 0]);
    }

    #[test]
    fn test_spread_puts_idlest_last() {
        let mut devices = vec![gpu(1, 0, 0, 0), gpu(0, 0, 2, 4000), gpu(2, 0, 1, 1000)];
        sort_devices(&mut devices, &request(), SchedulerPolicy::Spread);
        assert_eq!(order(&devices), vec![0, 2, 1]);
    }

    #[test]
    fn test_equal_scores_keep_index_order() {
        let mut devices = vec![gpu(1, 0, 0, 0), gpu(0, 0, 0, 0)];
        sort_devices(&mut devices, &request(), SchedulerPolicy::Binpack);
        assert_eq!(order(&devices), vec![0, 1]);
        sort_devices(&mut devices, &request(), SchedulerPolicy::Spread);
        assert_eq!(order(&devices), vec![0, 1]);
    }

    #[test]
    fn test_numa_grouping() {
        let devices = vec![gpu(0, 0, 0, 0), gpu(1, 0, 0, 0), gpu(2, 1, 0, 0), gpu(3, 1, 0, 0)];

        let mut binpack = devices.clone();
        sort_devices(&mut binpack, &request(), SchedulerPolicy::Binpack);
        assert_eq!(order(&binpack), vec![2, 3, 0, 1]);

        let mut spread = devices;
        sort_devices(&mut spread, &request(), SchedulerPolicy::Spread);
        assert_eq!(order(&spread), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_node_score() {
        let devices = vec![gpu(0, 0, 5, 4000), gpu(1, 0, 0, 0)];
        // 5/10 + 0 + 4000/8000
        assert!((node_score(&devices) - 10.0).abs() < 1e-9);
        assert_eq!(node_score(&[]), 0.0);
    }

    fn scored(node: &str, score: f64) -> NodeScore {
        NodeScore {
            node_id: node.to_string(),
            devices: PodDevices::new(),
            score,
        }
    }

    #[test]
    fn test_rank_nodes() {
        let mut scores = vec![scored("b", 3.0), scored("a", 3.0), scored("c", 5.0), scored("d", 1.0)];
        rank_nodes(&mut scores, SchedulerPolicy::Binpack);
        let names: Vec<&str> = scores.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b", "d"]);

        rank_nodes(&mut scores, SchedulerPolicy::Spread);
        let names: Vec<&str> = scores.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(names, vec!["d", "a", "b", "c"]);
    }
}
