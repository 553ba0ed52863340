use gpushare_core::PodDevices;
use serde::Serialize;
use std::collections::BTreeMap;

/// Fit of one pod on one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeScore {
    /// Node name
    pub node_id: String,
    /// Devices proposed for every container
    pub devices: PodDevices,
    /// Aggregate usage ratio after placing the pod
    pub score: f64,
}

/// Result of filtering candidate nodes for a pod
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterOutcome {
    /// Nodes the pod may go to
    pub node_names: Vec<String>,
    /// Rejected nodes and why
    pub failed_nodes: BTreeMap<String, String>,
    /// Pod-level failure
    pub error: Option<String>,
}

impl FilterOutcome {
    /// Every candidate passes; the pod asks for no managed device
    pub fn pass_all(node_names: Vec<String>) -> Self {
        Self {
            node_names,
            ..Default::default()
        }
    }

    /// A single node was chosen
    pub fn chosen(node: impl Into<String>, failed_nodes: BTreeMap<String, String>) -> Self {
        Self {
            node_names: vec![node.into()],
            failed_nodes,
            error: None,
        }
    }

    /// No node can take the pod
    pub fn fail(failed_nodes: BTreeMap<String, String>, error: impl Into<String>) -> Self {
        Self {
            node_names: Vec::new(),
            failed_nodes,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
