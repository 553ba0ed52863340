use crate::client::ClusterClient;
use crate::error::{Result, SchedulerError};
use crate::filter::fit_pod_on_node;
use crate::node_manager::NodeManager;
use crate::pod_manager::{PodInfo, PodManager};
use crate::quota::QuotaManager;
use crate::score::rank_nodes;
use crate::types::{FilterOutcome, NodeScore};
use chrono::Utc;
use gpushare_core::annotations::{
    ASSIGNED_NODE, ASSIGNED_TIME, BIND_PHASE, BIND_TIME, GPU_SCHEDULER_POLICY,
    NODE_SCHEDULER_POLICY,
};
use gpushare_core::{
    total_requested, BindPhase, NodeUsage, Pod, PodDevices, PodExt, ResourceQuota,
    SchedulerPolicy, SchedulingEvent, SchedulingEventReason,
};
use gpushare_device::{DeviceConfig, DeviceRegistry, FitFailure, FitReason};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name reported on recorded events
    pub scheduler_name: String,
    /// Default node policy, overridable per pod
    pub node_policy: SchedulerPolicy,
    /// Default device policy, overridable per pod
    pub gpu_policy: SchedulerPolicy,
    /// Interval between node registration and pod resync passes
    pub register_interval: Duration,
    /// How long a device plugin may leave a handshake request unanswered
    pub handshake_timeout: Duration,
    /// Capacity of the scheduling event channel
    pub event_capacity: usize,
    /// Request defaults handed to the vendors
    pub device: DeviceConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_name: "gpushare-scheduler".to_string(),
            node_policy: SchedulerPolicy::Binpack,
            gpu_policy: SchedulerPolicy::Spread,
            register_interval: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(60),
            event_capacity: 1024,
            device: DeviceConfig::default(),
        }
    }
}

/// Device-aware filter and bind for the Kubernetes scheduler
///
/// Owns the live device counters of every registered node, the pods holding
/// grants and the namespace quotas. Filter reserves a pod's grants on the
/// chosen node; bind confirms them or gives them back.
pub struct Scheduler {
    config: SchedulerConfig,
    registry: DeviceRegistry,
    nodes: NodeManager,
    pods: PodManager,
    quotas: QuotaManager,
    client: Arc<dyn ClusterClient>,
    event_tx: broadcast::Sender<SchedulingEvent>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: DeviceRegistry,
        client: Arc<dyn ClusterClient>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let quotas = QuotaManager::new(registry.quota_resources());
        Self {
            config,
            registry,
            nodes: NodeManager::new(),
            pods: PodManager::new(),
            quotas,
            client,
            event_tx,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn nodes(&self) -> &NodeManager {
        &self.nodes
    }

    pub fn pods(&self) -> &PodManager {
        &self.pods
    }

    pub fn quotas(&self) -> &QuotaManager {
        &self.quotas
    }

    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }

    /// Receive every scheduling event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulingEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: SchedulingEvent) {
        debug!(reason = %event.reason, pod = %event.pod_name, "Scheduling event");
        // No subscriber is not an error
        let _ = self.event_tx.send(event);
    }

    /// Choose a node for `pod` among `node_names` and reserve its devices there
    ///
    /// Pods asking for no managed device pass every candidate untouched. A pod
    /// that fits nowhere gets a per-node reason and a pod-level error in the
    /// outcome; only cluster API failures are returned as errors.
    pub async fn filter(&self, pod: &Pod, node_names: &[String]) -> Result<FilterOutcome> {
        let requests = self.registry.pod_requests(pod)?;
        if total_requested(&requests) == 0 {
            debug!(pod = %pod.key(), "Pod requests no managed device, passing all nodes");
            return Ok(FilterOutcome::pass_all(node_names.to_vec()));
        }

        let annotations = pod.annotations();
        let node_policy = SchedulerPolicy::from_annotations(
            &annotations,
            NODE_SCHEDULER_POLICY,
            self.config.node_policy,
        )?;
        let gpu_policy = SchedulerPolicy::from_annotations(
            &annotations,
            GPU_SCHEDULER_POLICY,
            self.config.gpu_policy,
        )?;

        // A retried pod gives back what its previous filter reserved
        if let Some(previous) = self.forget_pod(pod.uid()) {
            debug!(pod = %pod.key(), node = %previous.node, "Released previous reservation");
        }

        let mut failed = BTreeMap::new();
        let mut feasible = Vec::new();
        for name in node_names {
            let node = match self.nodes.get_node(name) {
                Ok(node) => node,
                Err(e) => {
                    failed.insert(name.clone(), e.to_string());
                    continue;
                }
            };
            match self.fit_on(&node, &requests, pod, &annotations, gpu_policy) {
                Ok(score) => feasible.push(score),
                Err(reason) => {
                    failed.insert(name.clone(), reason);
                }
            }
        }

        if feasible.is_empty() {
            return Ok(self.filter_failed(pod, failed));
        }

        rank_nodes(&mut feasible, node_policy);
        for candidate in feasible {
            if let Err(e) = self
                .nodes
                .commit(&pod.key(), &candidate.node_id, &candidate.devices)
            {
                warn!("{}", e);
                failed.insert(candidate.node_id.clone(), e.to_string());
                continue;
            }
            // Quota is claimed together with the devices
            if let Err(e) = self.quotas.try_add_usage(pod.namespace(), &candidate.devices) {
                debug!(pod = %pod.key(), node = %candidate.node_id, "{}", e);
                self.nodes.release(&candidate.node_id, &candidate.devices);
                failed.insert(
                    candidate.node_id.clone(),
                    FitFailure::single(FitReason::ResourceQuotaNotFit, 1).to_string(),
                );
                continue;
            }
            self.reserve(pod, &candidate).await?;

            info!(
                pod = %pod.key(),
                node = %candidate.node_id,
                score = candidate.score,
                "Pod assigned"
            );
            self.emit(SchedulingEvent::new(
                SchedulingEventReason::FilteringSucceed,
                pod.namespace(),
                pod.name(),
                pod.uid(),
                vec![candidate.node_id.clone()],
                format!("assigned to node {}", candidate.node_id),
            ));
            return Ok(FilterOutcome::chosen(candidate.node_id, failed));
        }

        Ok(self.filter_failed(pod, failed))
    }

    /// Fit the pod on one node, then check the namespace quota
    fn fit_on(
        &self,
        node: &NodeUsage,
        requests: &gpushare_core::PodDeviceRequests,
        pod: &Pod,
        annotations: &BTreeMap<String, String>,
        gpu_policy: SchedulerPolicy,
    ) -> std::result::Result<NodeScore, String> {
        let score = fit_pod_on_node(&self.registry, node, requests, annotations, gpu_policy)
            .map_err(|failure| failure.to_string())?;
        if let Some(resource) = self.quotas.exceeded_by(pod.namespace(), &score.devices) {
            debug!(pod = %pod.key(), node = %node.id, resource = %resource, "Quota exceeded");
            return Err(FitFailure::single(FitReason::ResourceQuotaNotFit, 1).to_string());
        }
        Ok(score)
    }

    /// Track the committed grants and their quota usage, then write them to the pod
    async fn reserve(&self, pod: &Pod, candidate: &NodeScore) -> Result<()> {
        self.pods.add_pod(PodInfo {
            namespace: pod.namespace().to_string(),
            name: pod.name().to_string(),
            uid: pod.uid().to_string(),
            node: candidate.node_id.clone(),
            devices: candidate.devices.clone(),
            quota_reserved: true,
        });

        let mut patch = BTreeMap::new();
        patch.insert(ASSIGNED_NODE.to_string(), candidate.node_id.clone());
        patch.insert(ASSIGNED_TIME.to_string(), Utc::now().timestamp().to_string());
        let written = self
            .registry
            .patch_annotations(&mut patch, &candidate.devices)
            .map_err(SchedulerError::from);
        let written = match written {
            Ok(()) => {
                self.client
                    .patch_pod_annotations(pod.namespace(), pod.name(), &patch)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            error!(pod = %pod.key(), "Failed to record device assignment: {}", e);
            self.forget_pod(pod.uid());
            return Err(e);
        }
        Ok(())
    }

    fn filter_failed(&self, pod: &Pod, failed: BTreeMap<String, String>) -> FilterOutcome {
        let summary = failed
            .iter()
            .map(|(node, reason)| format!("{}: {}", node, reason))
            .collect::<Vec<_>>()
            .join("; ");
        let err = SchedulerError::no_suitable_nodes(pod.key(), summary);
        info!("{}", err);
        self.emit(SchedulingEvent::new(
            SchedulingEventReason::FilteringFailed,
            pod.namespace(),
            pod.name(),
            pod.uid(),
            failed.keys().cloned().collect(),
            err.to_string(),
        ));
        FilterOutcome::fail(failed, err.to_string())
    }

    /// Bind a filtered pod to `node`
    ///
    /// Grants reserved by filter are reused; otherwise the grants recorded on
    /// the pod are committed again. Quota usage not yet claimed is checked and
    /// added before the binding is created, and everything is given back if
    /// any step fails.
    pub async fn bind(&self, namespace: &str, name: &str, uid: &str, node: &str) -> Result<()> {
        let pod = self.client.get_pod(namespace, name).await?;
        let uid = if uid.is_empty() { pod.uid() } else { uid };
        let key = pod.key();

        let devices = match self.pods.get_pod(uid) {
            Some(info) if info.node == node => info.devices,
            reserved => {
                if let Some(stale) = reserved {
                    warn!(pod = %key, reserved = %stale.node, node, "Binding to a different node than filtered");
                    self.forget_pod(uid);
                }
                let devices = self.registry.decode_pod_devices(&pod.annotations())?;
                if devices.is_empty() && total_requested(&self.registry.pod_requests(&pod)?) > 0 {
                    let e = SchedulerError::commit_conflict(&key, node, "no device assignment recorded");
                    self.bind_failed(&pod, node, &e).await;
                    return Err(e);
                }
                if !devices.is_empty() {
                    if let Err(e) = self.nodes.commit(&key, node, &devices) {
                        self.bind_failed(&pod, node, &e).await;
                        return Err(e);
                    }
                    self.pods.add_pod(PodInfo {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                        uid: uid.to_string(),
                        node: node.to_string(),
                        devices: devices.clone(),
                        quota_reserved: false,
                    });
                }
                devices
            }
        };

        if let Err(e) = self.reserve_quota(namespace, uid, &devices) {
            self.forget_pod(uid);
            self.bind_failed(&pod, node, &e).await;
            return Err(e);
        }

        let mut patch = BTreeMap::new();
        patch.insert(BIND_PHASE.to_string(), BindPhase::Allocating.to_string());
        patch.insert(BIND_TIME.to_string(), Utc::now().timestamp().to_string());
        if let Err(e) = self.client.patch_pod_annotations(namespace, name, &patch).await {
            self.forget_pod(uid);
            self.bind_failed(&pod, node, &e).await;
            return Err(e);
        }

        if let Err(e) = self.client.bind_pod(namespace, name, uid, node).await {
            self.forget_pod(uid);
            self.bind_failed(&pod, node, &e).await;
            return Err(e);
        }

        info!(pod = %key, node, "Pod bound");
        self.emit(SchedulingEvent::new(
            SchedulingEventReason::BindingSucceed,
            namespace,
            name,
            uid,
            vec![node.to_string()],
            format!("bound to node {}", node),
        ));
        Ok(())
    }

    /// Claim quota for a tracked pod whose usage is not counted yet
    fn reserve_quota(&self, namespace: &str, uid: &str, devices: &PodDevices) -> Result<()> {
        let counted = self.pods.get_pod(uid).is_none_or(|info| info.quota_reserved);
        if counted {
            return Ok(());
        }
        self.quotas.try_add_usage(namespace, devices)?;
        if !self.pods.mark_quota_reserved(uid) {
            // Forgotten or counted meanwhile
            self.quotas.rm_usage(namespace, devices)?;
        }
        Ok(())
    }

    /// Mark the pod's bind phase failed and report it
    async fn bind_failed(&self, pod: &Pod, node: &str, err: &SchedulerError) {
        error!(pod = %pod.key(), node, "Bind failed: {}", err);
        let mut patch = BTreeMap::new();
        patch.insert(BIND_PHASE.to_string(), BindPhase::Failed.to_string());
        if let Err(e) = self
            .client
            .patch_pod_annotations(pod.namespace(), pod.name(), &patch)
            .await
        {
            warn!(pod = %pod.key(), "Failed to mark bind phase failed: {}", e);
        }
        self.emit(SchedulingEvent::new(
            SchedulingEventReason::BindingFailed,
            pod.namespace(),
            pod.name(),
            pod.uid(),
            vec![node.to_string()],
            err.to_string(),
        ));
    }

    /// Stop tracking a pod, returning its grants to the node and its quota usage
    fn forget_pod(&self, uid: &str) -> Option<PodInfo> {
        let info = self.pods.del_pod(uid)?;
        self.nodes.release(&info.node, &info.devices);
        if info.quota_reserved {
            if let Err(e) = self.quotas.rm_usage(&info.namespace, &info.devices) {
                error!("{}", e);
            }
        }
        Some(info)
    }

    /// Account for a pod that already carries grants
    ///
    /// Rebuilds counters after a restart and picks up pods placed by another
    /// scheduler replica. Pods already tracked are left alone.
    pub fn on_add_pod(&self, pod: &Pod) -> Result<()> {
        if pod.is_terminated() || self.pods.contains(pod.uid()) {
            return Ok(());
        }
        let annotations = pod.annotations();
        if bind_phase_failed(&annotations) {
            return Ok(());
        }
        let bound = pod.spec.as_ref().and_then(|s| s.node_name.clone());
        let Some(node) = bound.clone().or_else(|| annotations.get(ASSIGNED_NODE).cloned()) else {
            return Ok(());
        };
        let devices = self.registry.decode_pod_devices(&annotations)?;
        if devices.is_empty() {
            return Ok(());
        }

        self.nodes.restore(&node, &devices);
        if bound.is_some() {
            self.quotas.add_usage(pod.namespace(), &devices);
        }
        self.pods.add_pod(PodInfo {
            namespace: pod.namespace().to_string(),
            name: pod.name().to_string(),
            uid: pod.uid().to_string(),
            node: node.clone(),
            devices,
            quota_reserved: bound.is_some(),
        });
        debug!(pod = %pod.key(), node = %node, "Tracking pod grants");
        Ok(())
    }

    /// Follow a pod change: finished or failed pods give their grants back
    pub fn on_update_pod(&self, pod: &Pod) -> Result<()> {
        if pod.is_terminated() || bind_phase_failed(&pod.annotations()) {
            self.on_del_pod(pod);
            return Ok(());
        }
        if let Some(info) = self.pods.get_pod(pod.uid()) {
            // Bound since we last looked, e.g. by another replica's bind
            let bound = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
            if bound == Some(info.node.as_str()) && self.pods.mark_quota_reserved(pod.uid()) {
                self.quotas.add_usage(&info.namespace, &info.devices);
            }
            return Ok(());
        }
        self.on_add_pod(pod)
    }

    pub fn on_del_pod(&self, pod: &Pod) {
        if let Some(info) = self.forget_pod(pod.uid()) {
            info!(pod = %pod.key(), node = %info.node, "Released pod grants");
        }
    }

    /// Forget a tracked pod that no longer exists
    pub fn forget_missing_pod(&self, uid: &str) {
        if let Some(info) = self.forget_pod(uid) {
            info!(pod = %format!("{}/{}", info.namespace, info.name), node = %info.node, "Released grants of vanished pod");
        }
    }

    pub fn add_quota(&self, quota: &ResourceQuota) -> Result<()> {
        self.quotas.add_quota(quota)
    }

    pub fn del_quota(&self, quota: &ResourceQuota) {
        self.quotas.del_quota(quota)
    }

    /// Grants of every tracked pod, for diagnostics
    pub fn pod_devices(&self) -> BTreeMap<String, PodDevices> {
        self.pods
            .list_pods()
            .into_iter()
            .map(|p| (format!("{}/{}", p.namespace, p.name), p.devices))
            .collect()
    }

    /// Forward scheduling events to the cluster until cancelled
    pub async fn forward_events(&self, token: CancellationToken) {
        let mut rx = self.subscribe();
        info!("Starting event forwarder");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Event forwarder shutting down");
                    return;
                }
                received = rx.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.client.record_event(&event).await {
                            warn!("Failed to record event for pod {}: {}", event.pod_name, e);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Event forwarder lagged, dropped {} events", missed);
                    }
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }
}

fn bind_phase_failed(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(BIND_PHASE)
        .and_then(|phase| phase.parse::<BindPhase>().ok())
        == Some(BindPhase::Failed)
}
