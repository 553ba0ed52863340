use crate::error::Result;
use crate::scheduler::Scheduler;
use chrono::Utc;
use gpushare_core::k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use gpushare_core::{Handshake, Node, NodeInfo, PodExt, ResourceQuota};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Keeps the scheduler's view of the cluster current
///
/// Each pass registers the device inventories device plugins published on
/// nodes, drops vendors whose plugin stopped answering the handshake, and
/// resyncs pods and namespace quotas.
pub struct Registrar {
    scheduler: Arc<Scheduler>,
    /// ResourceQuotas applied by the last pass, keyed by namespace/name
    quotas: Mutex<BTreeMap<String, ResourceQuota>>,
}

fn quota_key(quota: &ResourceQuota) -> String {
    format!(
        "{}/{}",
        quota.metadata.namespace.as_deref().unwrap_or("default"),
        quota.metadata.name.as_deref().unwrap_or_default()
    )
}

fn hard_limits(quota: &ResourceQuota) -> Option<&BTreeMap<String, Quantity>> {
    quota.spec.as_ref().and_then(|s| s.hard.as_ref())
}

impl Registrar {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            quotas: Mutex::new(BTreeMap::new()),
        }
    }

    /// Run registration passes until cancelled
    ///
    /// The first pass happens one interval in; callers run [`Self::sync`]
    /// once at startup.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let config = self.scheduler.config();
        info!(
            "Starting registrar (interval: {:?}, handshake timeout: {:?})",
            config.register_interval, config.handshake_timeout
        );

        let mut interval = tokio::time::interval(config.register_interval);
        // Consume the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Registrar shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    self.sync().await;
                }
            }
        }
    }

    /// One full pass; failures are logged and retried on the next pass
    pub async fn sync(&self) {
        if let Err(e) = self.sync_nodes().await {
            error!("Node registration failed: {}", e);
        }
        if let Err(e) = self.sync_quotas().await {
            error!("Quota resync failed: {}", e);
        }
        if let Err(e) = self.sync_pods().await {
            error!("Pod resync failed: {}", e);
        }
    }

    /// Register every node and forget nodes that left the cluster
    pub async fn sync_nodes(&self) -> Result<()> {
        debug!("Running node registration");
        let nodes = self.scheduler.client().list_nodes().await?;

        let mut seen = BTreeSet::new();
        for node in &nodes {
            let Some(name) = node.metadata.name.as_deref() else {
                continue;
            };
            seen.insert(name.to_string());
            if let Err(e) = self.register_from_node(node).await {
                warn!("Failed to register node {}: {}", name, e);
            }
        }

        for name in self.scheduler.nodes().list_nodes().into_keys() {
            if !seen.contains(&name) {
                self.scheduler.nodes().remove_node(&name);
            }
        }
        Ok(())
    }

    /// Register the inventories one node carries, vendor by vendor
    ///
    /// An inventory that fails to decode is skipped and leaves the vendor's
    /// previous devices in place.
    pub async fn register_from_node(&self, node: &Node) -> Result<()> {
        let Some(name) = node.metadata.name.as_deref() else {
            return Ok(());
        };
        let annotations = node.metadata.annotations.clone().unwrap_or_default();
        let shared = Arc::new(node.clone());
        let timeout = chrono::Duration::from_std(self.scheduler.config().handshake_timeout)
            .unwrap_or(chrono::Duration::seconds(60));

        let mut patch = BTreeMap::new();
        for device in self.scheduler.registry().iter() {
            let vendor = device.vendor();
            let handshake_key = device.keys().handshake;
            let handshake = match annotations.get(handshake_key) {
                Some(raw) => match raw.parse::<Handshake>() {
                    Ok(h) => Some(h),
                    Err(e) => {
                        warn!(node = name, vendor, "Ignoring handshake: {}", e);
                        None
                    }
                },
                None => None,
            };

            match handshake {
                Some(Handshake::Requesting(since)) if Utc::now() - since > timeout => {
                    warn!(
                        node = name,
                        vendor, "Device plugin did not answer the handshake, removing its devices"
                    );
                    self.scheduler.nodes().rm_node_device(name, vendor);
                    patch.insert(handshake_key.to_string(), Handshake::deleted_now().to_string());
                    continue;
                }
                Some(Handshake::Deleted(_)) => continue,
                _ => {}
            }

            let devices = match device.node_devices(node) {
                Ok(Some(devices)) if !devices.is_empty() => devices,
                Ok(_) => continue,
                Err(e) => {
                    warn!(node = name, vendor, "Skipping undecodable inventory: {}", e);
                    continue;
                }
            };
            debug!(node = name, vendor, devices = devices.len(), "Registering devices");
            self.scheduler
                .nodes()
                .add_node(name, NodeInfo::new(name, shared.clone(), devices));

            if let Some(Handshake::Reported(_)) = handshake {
                patch.insert(
                    handshake_key.to_string(),
                    Handshake::requesting_now().to_string(),
                );
            }
        }

        if !patch.is_empty() {
            self.scheduler
                .client()
                .patch_node_annotations(name, &patch)
                .await?;
        }
        Ok(())
    }

    /// Reapply every ResourceQuota's limits
    ///
    /// Limits of quotas that were deleted or changed since the last pass are
    /// dropped first, so a removed `limits.*` key stops being enforced.
    pub async fn sync_quotas(&self) -> Result<()> {
        let listed = self.scheduler.client().list_resource_quotas().await?;
        let current: BTreeMap<String, ResourceQuota> =
            listed.into_iter().map(|q| (quota_key(&q), q)).collect();

        let mut applied = self.quotas.lock();
        for (key, previous) in applied.iter() {
            let unchanged = current
                .get(key)
                .is_some_and(|q| hard_limits(q) == hard_limits(previous));
            if !unchanged {
                debug!(quota = %key, "Dropping quota limits");
                self.scheduler.del_quota(previous);
            }
        }
        for (key, quota) in &current {
            if let Err(e) = self.scheduler.add_quota(quota) {
                warn!("Ignoring quota {}: {}", key, e);
            }
        }
        *applied = current;
        Ok(())
    }

    /// Pick up placed pods and release the grants of pods that are gone
    pub async fn sync_pods(&self) -> Result<()> {
        // Pods filtered while the list is in flight are not in this snapshot
        let tracked = self.scheduler.pods().list_pods();
        let pods = self.scheduler.client().list_pods().await?;
        let mut seen = BTreeSet::new();
        for pod in &pods {
            seen.insert(pod.uid().to_string());
            if let Err(e) = self.scheduler.on_update_pod(pod) {
                warn!("Failed to account pod {}: {}", pod.key(), e);
            }
        }
        for info in tracked {
            if !seen.contains(&info.uid) {
                self.scheduler.forget_missing_pod(&info.uid);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;
    use crate::scheduler::SchedulerConfig;
    use gpushare_core::annotations::{ASSIGNED_NODE, BIND_PHASE};
    use gpushare_core::k8s_openapi::api::core::v1::ResourceQuotaSpec;
    use gpushare_core::{ObjectMeta, Pod};
    use gpushare_device::DeviceRegistry;

    const REGISTER: &str = "gpushare.io/node-nvidia-register";
    const HANDSHAKE: &str = "gpushare.io/node-handshake-nvidia";
    const INVENTORY: &str = "GPU-0,10,8000,100,NVIDIA-Tesla T4,0,true:GPU-1,10,8000,100,NVIDIA-Tesla T4,0,true:";

    fn setup() -> (Arc<MockCluster>, Arc<Scheduler>, Registrar) {
        let cluster = Arc::new(MockCluster::new());
        let config = SchedulerConfig::default();
        let registry = DeviceRegistry::with_defaults(&config.device);
        let scheduler = Arc::new(Scheduler::new(config, registry, cluster.clone()));
        let registrar = Registrar::new(scheduler.clone());
        (cluster, scheduler, registrar)
    }

    fn node(name: &str, annotations: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn handshake_of(node: &Node) -> Handshake {
        node.metadata.annotations.as_ref().unwrap()[HANDSHAKE]
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_and_request_handshake() {
        let (cluster, scheduler, registrar) = setup();
        let reported = Handshake::Reported(Utc::now()).to_string();
        cluster
            .insert_node(node("a", &[(REGISTER, INVENTORY), (HANDSHAKE, &reported)]))
            .await;

        registrar.sync_nodes().await.unwrap();
        let usage = scheduler.nodes().get_node("a").unwrap();
        assert_eq!(usage.devices.len(), 2);
        assert_eq!(usage.devices[1].index, 1);

        let patched = cluster.node("a").await.unwrap();
        assert!(matches!(handshake_of(&patched), Handshake::Requesting(_)));
    }

    #[tokio::test]
    async fn test_expired_handshake_removes_devices() {
        let (cluster, scheduler, registrar) = setup();
        cluster.insert_node(node("a", &[(REGISTER, INVENTORY)])).await;
        registrar.sync_nodes().await.unwrap();
        assert!(scheduler.nodes().get_node("a").is_ok());

        let stale = Handshake::Requesting(Utc::now() - chrono::Duration::seconds(600)).to_string();
        cluster
            .insert_node(node("a", &[(REGISTER, INVENTORY), (HANDSHAKE, &stale)]))
            .await;
        registrar.sync_nodes().await.unwrap();
        assert!(scheduler.nodes().get_node("a").is_err());
        let patched = cluster.node("a").await.unwrap();
        assert!(matches!(handshake_of(&patched), Handshake::Deleted(_)));

        // Stays removed until the plugin reports again
        registrar.sync_nodes().await.unwrap();
        assert!(scheduler.nodes().get_node("a").is_err());
    }

    #[tokio::test]
    async fn test_bad_inventory_is_skipped() {
        let (cluster, scheduler, registrar) = setup();
        cluster.insert_node(node("a", &[(REGISTER, INVENTORY)])).await;
        cluster
            .insert_node(node("b", &[(REGISTER, "GPU-9,ten,8000,100,T4,0,true:")]))
            .await;
        registrar.sync_nodes().await.unwrap();
        assert!(scheduler.nodes().get_node("a").is_ok());
        assert!(scheduler.nodes().get_node("b").is_err());
    }

    #[tokio::test]
    async fn test_vanished_node_is_removed() {
        let (cluster, scheduler, registrar) = setup();
        cluster.insert_node(node("a", &[(REGISTER, INVENTORY)])).await;
        registrar.sync_nodes().await.unwrap();
        cluster.remove_node("a").await;
        registrar.sync_nodes().await.unwrap();
        assert!(scheduler.nodes().list_nodes().is_empty());
    }

    #[tokio::test]
    async fn test_pod_resync_tracks_and_releases() {
        let (cluster, scheduler, registrar) = setup();
        cluster.insert_node(node("a", &[(REGISTER, INVENTORY)])).await;
        registrar.sync_nodes().await.unwrap();

        let mut annotations = BTreeMap::new();
        annotations.insert(ASSIGNED_NODE.to_string(), "a".to_string());
        annotations.insert(BIND_PHASE.to_string(), "success".to_string());
        annotations.insert(
            "gpushare.io/vgpu-devices-allocated".to_string(),
            "GPU-1,NVIDIA,1000,30,1:;".to_string(),
        );
        let mut pod = Pod {
            metadata: ObjectMeta {
                name: Some("train".to_string()),
                namespace: Some("ml".to_string()),
                uid: Some("uid-train".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        };
        pod.spec = Some(Default::default());
        pod.spec.as_mut().unwrap().node_name = Some("a".to_string());
        cluster.insert_pod(pod).await;

        registrar.sync_pods().await.unwrap();
        let usage = scheduler.nodes().get_node("a").unwrap();
        assert_eq!(usage.devices[1].used, 1);
        assert_eq!(usage.devices[1].usedmem, 1000);

        cluster.remove_pod("ml", "train").await;
        registrar.sync_pods().await.unwrap();
        let usage = scheduler.nodes().get_node("a").unwrap();
        assert_eq!(usage.devices[1].used, 0);
        assert!(scheduler.pods().list_pods().is_empty());
    }

    fn gpu_quota(hard: &[(&str, &str)]) -> ResourceQuota {
        ResourceQuota {
            metadata: ObjectMeta {
                name: Some("gpu".to_string()),
                namespace: Some("ml".to_string()),
                ..Default::default()
            },
            spec: Some(ResourceQuotaSpec {
                hard: Some(
                    hard.iter()
                        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn limit(scheduler: &Scheduler, resource: &str) -> i64 {
        scheduler
            .quotas()
            .get("ml", resource)
            .map(|q| q.limit)
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_quota_resync_follows_changes() {
        let (cluster, scheduler, registrar) = setup();
        cluster
            .insert_quota(gpu_quota(&[
                ("limits.nvidia.com/gpumem", "1500"),
                ("limits.nvidia.com/gpucores", "50"),
            ]))
            .await;
        registrar.sync_quotas().await.unwrap();
        assert_eq!(limit(&scheduler, "nvidia.com/gpumem"), 1500);
        assert_eq!(limit(&scheduler, "nvidia.com/gpucores"), 50);

        // One key removed, the other raised
        cluster
            .insert_quota(gpu_quota(&[("limits.nvidia.com/gpumem", "4000")]))
            .await;
        registrar.sync_quotas().await.unwrap();
        assert_eq!(limit(&scheduler, "nvidia.com/gpumem"), 4000);
        assert_eq!(limit(&scheduler, "nvidia.com/gpucores"), 0);

        cluster.remove_quota("ml", "gpu").await;
        registrar.sync_quotas().await.unwrap();
        assert_eq!(limit(&scheduler, "nvidia.com/gpumem"), 0);
        assert!(scheduler.quotas().fit_quota("ml", "nvidia.com/gpumem", 100_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let (cluster, scheduler, registrar) = setup();
        cluster.insert_node(node("a", &[(REGISTER, INVENTORY)])).await;
        let token = CancellationToken::new();
        let handle = {
            let token = token.clone();
            tokio::spawn(async move { registrar.run(token).await })
        };
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(scheduler.nodes().get_node("a").is_err());
        tokio::time::sleep(std::time::Duration::from_secs(15)).await;
        assert!(scheduler.nodes().get_node("a").is_ok());
        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
