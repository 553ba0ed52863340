use crate::error::Result;
use async_trait::async_trait;
use gpushare_core::{Node, Pod, ResourceQuota, SchedulingEvent};
use std::collections::BTreeMap;

/// Cluster API operations the scheduler depends on
///
/// Implemented by [`crate::ApiClient`] against a Kubernetes API server and by
/// [`crate::MockCluster`] in memory.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Merge `annotations` into the pod's annotations
    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Create the pod's Binding to `node`
    async fn bind_pod(&self, namespace: &str, name: &str, uid: &str, node: &str) -> Result<()>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Pods of every namespace
    async fn list_pods(&self) -> Result<Vec<Pod>>;

    /// ResourceQuotas of every namespace
    async fn list_resource_quotas(&self) -> Result<Vec<ResourceQuota>>;

    /// Merge `annotations` into the node's annotations
    async fn patch_node_annotations(
        &self,
        node: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Publish a scheduling decision as a Kubernetes Event
    async fn record_event(&self, event: &SchedulingEvent) -> Result<()>;
}
