//! gpushare Scheduler - Device-aware filter and bind for Kubernetes
//!
//! This crate provides:
//! - Live device counters per node and the pods holding grants
//! - Per-node fitting and binpack/spread scoring
//! - Namespace device quotas
//! - Filter and bind with atomic commit and rollback
//! - Node registration with the device plugin handshake
//! - Cluster API client and an in-memory cluster for tests

pub mod api_client;
pub mod client;
pub mod error;
pub mod filter;
pub mod mock;
pub mod node_manager;
pub mod pod_manager;
pub mod quota;
pub mod registrar;
pub mod scheduler;
pub mod score;
pub mod types;

// Re-export commonly used types
pub use api_client::ApiClient;
pub use client::ClusterClient;
pub use error::{Result, SchedulerError};
pub use mock::MockCluster;
pub use node_manager::NodeManager;
pub use pod_manager::{PodInfo, PodManager};
pub use quota::{DeviceQuota, QuotaManager};
pub use registrar::Registrar;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use types::{FilterOutcome, NodeScore};
