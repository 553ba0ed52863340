// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Scheduler error type
#[derive(Error, Debug, Diagnostic)]
pub enum SchedulerError {
    /// Node is not registered with the node manager
    #[error("Node {node} is not registered")]
    #[diagnostic(
        code(scheduler::node_not_found),
        help("The node has no device plugin inventory yet; check the plugin's register annotation on the node")
    )]
    NodeNotFound {
        #[allow(unused)]
        node: String,
    },

    /// No suitable nodes found
    #[error("No suitable nodes found for pod {pod_name}: {reason}")]
    #[diagnostic(
        code(scheduler::no_suitable_nodes),
        help("Check device capacity, type and UUID selectors, and namespace quota")
    )]
    NoSuitableNodes {
        #[allow(unused)]
        pod_name: String,
        #[allow(unused)]
        reason: String,
    },

    /// Another pod took the capacity between fit and commit
    #[error("Cannot commit devices of pod {pod_name} on node {node}: {reason}")]
    #[diagnostic(
        code(scheduler::commit_conflict),
        help("The pod is left unscheduled; the Kubernetes scheduler retries it")
    )]
    CommitConflict {
        #[allow(unused)]
        pod_name: String,
        #[allow(unused)]
        node: String,
        #[allow(unused)]
        reason: String,
    },

    /// Granting the pod would exceed a namespace quota
    #[error("Quota of {resource} in namespace {namespace} exceeded ({used} + {request} > {limit})")]
    #[diagnostic(
        code(scheduler::quota_exceeded),
        help("Raise the ResourceQuota limit or wait for pods in the namespace to finish")
    )]
    QuotaExceeded {
        #[allow(unused)]
        namespace: String,
        #[allow(unused)]
        resource: String,
        #[allow(unused)]
        used: i64,
        #[allow(unused)]
        request: i64,
        #[allow(unused)]
        limit: i64,
    },

    /// Quota release larger than the recorded usage
    #[error("Quota usage of {resource} in namespace {namespace} would go negative ({used} - {release})")]
    #[diagnostic(
        code(scheduler::quota_underflow),
        help("A pod's usage was released twice or never added. This is likely a bug. Please report it")
    )]
    QuotaUnderflow {
        #[allow(unused)]
        namespace: String,
        #[allow(unused)]
        resource: String,
        #[allow(unused)]
        used: i64,
        #[allow(unused)]
        release: i64,
    },

    /// Cluster API call failed
    #[error("Cluster API error: {message}")]
    #[diagnostic(
        code(scheduler::cluster_error),
        help("Check connectivity to the API server and the scheduler's RBAC permissions")
    )]
    ClusterError {
        #[allow(unused)]
        message: String,
    },

    /// Pod does not exist in the cluster
    #[error("Pod {namespace}/{name} not found")]
    #[diagnostic(
        code(scheduler::pod_not_found),
        help("The pod may have been deleted while it was being scheduled")
    )]
    PodNotFound {
        #[allow(unused)]
        namespace: String,
        #[allow(unused)]
        name: String,
    },

    /// Device error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Device(#[from] gpushare_device::DeviceError),

    /// Core error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] gpushare_core::CoreError),

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(scheduler::internal_error),
        help("This is likely a bug. Please report it")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    /// Create a NodeNotFound error
    pub fn node_not_found(node: impl Into<String>) -> Self {
        Self::NodeNotFound { node: node.into() }
    }

    /// Create a NoSuitableNodes error
    pub fn no_suitable_nodes(pod_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NoSuitableNodes {
            pod_name: pod_name.into(),
            reason: reason.into(),
        }
    }

    /// Create a CommitConflict error
    pub fn commit_conflict(
        pod_name: impl Into<String>,
        node: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::CommitConflict {
            pod_name: pod_name.into(),
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Create a QuotaExceeded error
    pub fn quota_exceeded(
        namespace: impl Into<String>,
        resource: impl Into<String>,
        used: i64,
        request: i64,
        limit: i64,
    ) -> Self {
        Self::QuotaExceeded {
            namespace: namespace.into(),
            resource: resource.into(),
            used,
            request,
            limit,
        }
    }

    /// Create a QuotaUnderflow error
    pub fn quota_underflow(
        namespace: impl Into<String>,
        resource: impl Into<String>,
        used: i64,
        release: i64,
    ) -> Self {
        Self::QuotaUnderflow {
            namespace: namespace.into(),
            resource: resource.into(),
            used,
            release,
        }
    }

    /// Create a ClusterError
    pub fn cluster_error(message: impl Into<String>) -> Self {
        Self::ClusterError {
            message: message.into(),
        }
    }

    /// Create a PodNotFound error
    pub fn pod_not_found(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::PodNotFound {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}
