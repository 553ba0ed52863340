use crate::client::ClusterClient;
use crate::error::{Result, SchedulerError};
use async_trait::async_trait;
use chrono::Utc;
use gpushare_core::k8s_openapi::api::core::v1::{Binding, Event, EventSource, ObjectReference};
use gpushare_core::k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use gpushare_core::{Node, ObjectMeta, Pod, ResourceQuota, SchedulingEvent};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, warn};

const MERGE_PATCH: &str = "application/merge-patch+json";

/// HTTP client for the Kubernetes API server
pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    component: String,
    client: Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            component: "gpushare-scheduler".to_string(),
            client: Client::new(),
        }
    }

    /// Authenticate with a bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Component name reported as the source of recorded events
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, method: &str, url: &str, request: RequestBuilder) -> Result<Response> {
        debug!("{} {}", method, url);
        let resp = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| SchedulerError::cluster_error(format!("HTTP request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SchedulerError::cluster_error(format!(
                "{} {} failed with status {}: {}",
                method, url, status, body
            )));
        }
        Ok(resp)
    }

    /// GET a list endpoint and parse its items, skipping items that fail to parse
    async fn list<T: DeserializeOwned>(&self, path: &str, kind: &str) -> Result<Vec<T>> {
        let url = format!("{}{}", self.base_url, path);
        let request = self.client.get(&url);
        let body: serde_json::Value = self
            .send("GET", &url, request)
            .await?
            .json()
            .await
            .map_err(|e| {
                SchedulerError::cluster_error(format!("Failed to parse {} list: {}", kind, e))
            })?;

        let items = body["items"].as_array().cloned().unwrap_or_default();
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<T>(item) {
                Ok(obj) => out.push(obj),
                Err(e) => warn!("Failed to parse {} from list: {}", kind, e),
            }
        }
        Ok(out)
    }

    async fn merge_annotations(&self, url: String, annotations: &BTreeMap<String, String>) -> Result<()> {
        let body = json!({ "metadata": { "annotations": annotations } });
        let request = self
            .client
            .patch(&url)
            .header(CONTENT_TYPE, MERGE_PATCH)
            .body(body.to_string());
        self.send("PATCH", &url, request).await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for ApiClient {
    /// GET /api/v1/namespaces/{namespace}/pods/{name}
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}",
            self.base_url, namespace, name
        );
        debug!("GET {}", url);

        let resp = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| SchedulerError::cluster_error(format!("HTTP request failed: {}", e)))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SchedulerError::pod_not_found(namespace, name));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SchedulerError::cluster_error(format!(
                "GET pod failed with status {}: {}",
                status, body
            )));
        }

        resp.json::<Pod>()
            .await
            .map_err(|e| SchedulerError::cluster_error(format!("Failed to parse pod: {}", e)))
    }

    /// PATCH /api/v1/namespaces/{namespace}/pods/{name}
    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}",
            self.base_url, namespace, name
        );
        self.merge_annotations(url, annotations).await
    }

    /// POST /api/v1/namespaces/{namespace}/pods/{name}/binding
    async fn bind_pod(&self, namespace: &str, name: &str, uid: &str, node: &str) -> Result<()> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}/binding",
            self.base_url, namespace, name
        );
        let binding = Binding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            target: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Node".to_string()),
                name: Some(node.to_string()),
                ..Default::default()
            },
        };
        let request = self.client.post(&url).json(&binding);
        self.send("POST", &url, request).await?;
        Ok(())
    }

    /// GET /api/v1/nodes
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.list("/api/v1/nodes", "node").await
    }

    /// GET /api/v1/pods
    async fn list_pods(&self) -> Result<Vec<Pod>> {
        self.list("/api/v1/pods", "pod").await
    }

    /// GET /api/v1/resourcequotas
    async fn list_resource_quotas(&self) -> Result<Vec<ResourceQuota>> {
        self.list("/api/v1/resourcequotas", "resourcequota").await
    }

    /// PATCH /api/v1/nodes/{name}
    async fn patch_node_annotations(
        &self,
        node: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let url = format!("{}/api/v1/nodes/{}", self.base_url, node);
        self.merge_annotations(url, annotations).await
    }

    /// POST /api/v1/namespaces/{namespace}/events
    async fn record_event(&self, event: &SchedulingEvent) -> Result<()> {
        let url = format!(
            "{}/api/v1/namespaces/{}/events",
            self.base_url, event.pod_namespace
        );
        let body = Event {
            metadata: ObjectMeta {
                name: Some(format!("{}.{}", event.pod_name, event.id)),
                namespace: Some(event.pod_namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Pod".to_string()),
                name: Some(event.pod_name.clone()),
                namespace: Some(event.pod_namespace.clone()),
                uid: Some(event.pod_uid.clone()),
                ..Default::default()
            },
            reason: Some(event.reason.k8s_reason().to_string()),
            message: Some(event.message.clone()),
            type_: Some(event.reason.k8s_type().to_string()),
            count: Some(1),
            first_timestamp: Some(Time(event.timestamp)),
            last_timestamp: Some(Time(Utc::now())),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                host: None,
            }),
            ..Default::default()
        };
        let request = self.client.post(&url).json(&body);
        self.send("POST", &url, request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trimmed() {
        let client = ApiClient::new("https://10.0.0.1:6443/")
            .with_token("secret")
            .with_component("gpushare");
        assert_eq!(client.base_url(), "https://10.0.0.1:6443");
        assert_eq!(client.component, "gpushare");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_cluster_error() {
        let client = ApiClient::new("http://127.0.0.1:1");
        let err = client.get_pod("default", "job").await.unwrap_err();
        assert!(matches!(err, SchedulerError::ClusterError { .. }));
    }
}
