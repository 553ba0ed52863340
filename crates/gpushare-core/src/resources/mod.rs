pub mod quantities;

pub use quantities::ResourceQuantities;

use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

/// Accessors for the pod fields the scheduler keys on
pub trait PodExt {
    /// Pod name, empty when unset
    fn name(&self) -> &str;

    /// Pod namespace, "default" when unset
    fn namespace(&self) -> &str;

    /// Pod UID, empty when unset
    fn uid(&self) -> &str;

    /// `namespace/name`
    fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    /// Annotations, empty when unset
    fn annotations(&self) -> BTreeMap<String, String>;

    /// Containers of the pod spec
    fn containers(&self) -> &[Container];

    /// Pod phase, if reported
    fn phase(&self) -> Option<&str>;

    /// Whether the pod reached `Succeeded` or `Failed`
    fn is_terminated(&self) -> bool {
        matches!(self.phase(), Some("Succeeded") | Some("Failed"))
    }
}

impl PodExt for Pod {
    fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or_default()
    }

    fn annotations(&self) -> BTreeMap<String, String> {
        self.metadata.annotations.clone().unwrap_or_default()
    }

    fn containers(&self) -> &[Container] {
        self.spec
            .as_ref()
            .map(|s| s.containers.as_slice())
            .unwrap_or_default()
    }

    fn phase(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.phase.as_deref())
    }
}

/// Device resources of a container: limits, falling back to requests per name
pub fn container_resources(container: &Container) -> BTreeMap<String, Quantity> {
    let mut merged = BTreeMap::new();
    if let Some(resources) = &container.resources {
        if let Some(requests) = &resources.requests {
            merged.extend(requests.clone());
        }
        if let Some(limits) = &resources.limits {
            merged.extend(limits.clone());
        }
    }
    merged
}
