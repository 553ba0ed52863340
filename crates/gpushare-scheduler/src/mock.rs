use crate::client::ClusterClient;
use crate::error::{Result, SchedulerError};
use async_trait::async_trait;
use gpushare_core::{Node, Pod, PodExt, ResourceQuota, SchedulingEvent};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory cluster for tests and dry runs
///
/// Pods and nodes live in maps; annotation patches are applied as JSON merge
/// patches and binds set `spec.nodeName`.
#[derive(Default)]
pub struct MockCluster {
    pods: Arc<RwLock<BTreeMap<String, Pod>>>,
    nodes: Arc<RwLock<BTreeMap<String, Node>>>,
    quotas: Arc<RwLock<BTreeMap<String, ResourceQuota>>>,
    events: Arc<RwLock<Vec<SchedulingEvent>>>,
    fail_binds: AtomicBool,
}

fn merge_annotations<T>(object: &T, annotations: &BTreeMap<String, String>) -> Result<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let mut value = serde_json::to_value(object)
        .map_err(|e| SchedulerError::internal_error(format!("Failed to serialize object: {}", e)))?;
    json_patch::merge(&mut value, &json!({ "metadata": { "annotations": annotations } }));
    serde_json::from_value(value)
        .map_err(|e| SchedulerError::internal_error(format!("Failed to deserialize object: {}", e)))
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_pod(&self, pod: Pod) {
        self.pods.write().await.insert(pod.key(), pod);
    }

    pub async fn insert_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.nodes.write().await.insert(name, node);
    }

    pub async fn remove_node(&self, name: &str) {
        self.nodes.write().await.remove(name);
    }

    pub async fn remove_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods
            .write()
            .await
            .remove(&format!("{}/{}", namespace, name))
    }

    /// Insert or replace a quota by namespace and name
    pub async fn insert_quota(&self, quota: ResourceQuota) {
        let key = format!(
            "{}/{}",
            quota.metadata.namespace.as_deref().unwrap_or("default"),
            quota.metadata.name.as_deref().unwrap_or_default()
        );
        self.quotas.write().await.insert(key, quota);
    }

    pub async fn remove_quota(&self, namespace: &str, name: &str) -> Option<ResourceQuota> {
        self.quotas
            .write()
            .await
            .remove(&format!("{}/{}", namespace, name))
    }

    pub async fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods
            .read()
            .await
            .get(&format!("{}/{}", namespace, name))
            .cloned()
    }

    pub async fn node(&self, name: &str) -> Option<Node> {
        self.nodes.read().await.get(name).cloned()
    }

    pub async fn events(&self) -> Vec<SchedulingEvent> {
        self.events.read().await.clone()
    }

    /// Make every following bind fail
    pub fn set_fail_binds(&self, fail: bool) {
        self.fail_binds.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pod(namespace, name)
            .await
            .ok_or_else(|| SchedulerError::pod_not_found(namespace, name))
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut pods = self.pods.write().await;
        let pod = pods
            .get_mut(&format!("{}/{}", namespace, name))
            .ok_or_else(|| SchedulerError::pod_not_found(namespace, name))?;
        *pod = merge_annotations(pod, annotations)?;
        debug!("Mock: patched pod {}/{}", namespace, name);
        Ok(())
    }

    async fn bind_pod(&self, namespace: &str, name: &str, _uid: &str, node: &str) -> Result<()> {
        if self.fail_binds.load(Ordering::SeqCst) {
            return Err(SchedulerError::cluster_error(format!(
                "binding {}/{} rejected",
                namespace, name
            )));
        }
        let mut pods = self.pods.write().await;
        let pod = pods
            .get_mut(&format!("{}/{}", namespace, name))
            .ok_or_else(|| SchedulerError::pod_not_found(namespace, name))?;
        pod.spec.get_or_insert_with(Default::default).node_name = Some(node.to_string());
        debug!("Mock: bound pod {}/{} to {}", namespace, name, node);
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.read().await.values().cloned().collect())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.pods.read().await.values().cloned().collect())
    }

    async fn list_resource_quotas(&self) -> Result<Vec<ResourceQuota>> {
        Ok(self.quotas.read().await.values().cloned().collect())
    }

    async fn patch_node_annotations(
        &self,
        node: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let entry = nodes
            .get_mut(node)
            .ok_or_else(|| SchedulerError::node_not_found(node))?;
        *entry = merge_annotations(entry, annotations)?;
        Ok(())
    }

    async fn record_event(&self, event: &SchedulingEvent) -> Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpushare_core::ObjectMeta;

    fn pod(name: &str) -> Pod {
        let mut annotations = BTreeMap::new();
        annotations.insert("keep".to_string(), "me".to_string());
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_patch_merges_annotations() {
        let cluster = MockCluster::new();
        cluster.insert_pod(pod("job")).await;

        let mut patch = BTreeMap::new();
        patch.insert("added".to_string(), "yes".to_string());
        cluster
            .patch_pod_annotations("default", "job", &patch)
            .await
            .unwrap();

        let annotations = cluster.get_pod("default", "job").await.unwrap().annotations();
        assert_eq!(annotations["keep"], "me");
        assert_eq!(annotations["added"], "yes");
    }

    #[tokio::test]
    async fn test_bind_sets_node_name() {
        let cluster = MockCluster::new();
        cluster.insert_pod(pod("job")).await;
        cluster.bind_pod("default", "job", "uid", "node-a").await.unwrap();
        let bound = cluster.get_pod("default", "job").await.unwrap();
        assert_eq!(bound.spec.unwrap().node_name.as_deref(), Some("node-a"));

        cluster.set_fail_binds(true);
        assert!(cluster.bind_pod("default", "job", "uid", "node-a").await.is_err());
        assert!(cluster.get_pod("default", "missing").await.is_err());
    }
}
