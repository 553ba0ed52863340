//! gpushare Core - Data model shared by the scheduler extender and device plugins
//!
//! This crate provides:
//! - Device inventory, usage and grant types
//! - The annotation codec used to hand grants from scheduler to device plugin
//! - Annotation keys, policies and bind phases
//! - Error types with miette diagnostics

pub mod annotations;
pub mod codec;
pub mod error;
pub mod events;
pub mod resources;
pub mod types;

// Re-export commonly used types
pub use annotations::{BindPhase, Handshake, SchedulerPolicy};
pub use error::{CoreError, Result};
pub use events::{SchedulingEvent, SchedulingEventReason};
pub use resources::{container_resources, PodExt, ResourceQuantities};
pub use types::{
    total_requested, ContainerDevice, ContainerDeviceRequest, ContainerDeviceRequests,
    ContainerDevices, DeviceInfo, DeviceUsage, NodeInfo, NodeUsage, PodDeviceRequests, PodDevices,
    PodSingleDevice, EXCLUSIVE_CORES, MEM_PERCENTAGE_ABSOLUTE,
};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::{Container, Node, Pod, ResourceQuota};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
