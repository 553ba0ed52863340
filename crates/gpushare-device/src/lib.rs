//! gpushare Device - Vendor capabilities for shared accelerators
//!
//! Each vendor turns container resource limits into device requests, fits
//! requests onto a node's devices, and turns grants back into what its device
//! plugin hands to the container runtime.

pub mod allocate;
pub mod amd;
pub mod cambricon;
mod checks;
pub mod config;
pub mod enflame;
pub mod error;
pub mod fit;
pub mod kunlun;
pub mod nvidia;
pub mod registry;
mod request;
pub mod traits;

// Re-export commonly used types
pub use allocate::{allocate, ContainerAllocation, PluginAllocation};
pub use config::DeviceConfig;
pub use error::{DeviceError, Result};
pub use fit::{FitFailure, FitReason, FitReasons};
pub use registry::{DeviceRegistry, QuotaKind, QuotaResource};
pub use traits::{Device, FitContext, ResourceNames, VendorKeys};
