// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Device error type for vendor capability operations
#[derive(Error, Debug, Diagnostic)]
pub enum DeviceError {
    /// Vendor is not registered
    #[error("Unknown device vendor: {vendor}")]
    #[diagnostic(
        code(gpushare::device::unknown_vendor),
        help("Registered vendors are listed by DeviceRegistry::vendors(); enable the vendor at startup")
    )]
    UnknownVendor {
        #[allow(unused)]
        vendor: String,
    },

    /// Container asks for device resources that cannot be normalized
    #[error("Invalid device request in container {container}: {reason}")]
    #[diagnostic(
        code(gpushare::device::invalid_request),
        help("Device counts must be positive, and memory and core percentages must be within 0-100")
    )]
    InvalidRequest {
        #[allow(unused)]
        container: String,
        #[allow(unused)]
        reason: String,
    },

    /// No pending grant for the device plugin to hand out
    #[error("No pending {vendor} allocation for pod {pod}")]
    #[diagnostic(
        code(gpushare::device::allocation_not_found),
        help("The pod was not scheduled through the gpushare extender, or all of its containers were already allocated")
    )]
    AllocationNotFound {
        #[allow(unused)]
        pod: String,
        #[allow(unused)]
        vendor: String,
    },

    /// Annotation codec error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] gpushare_core::CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create an UnknownVendor error
    pub fn unknown_vendor(vendor: impl Into<String>) -> Self {
        Self::UnknownVendor {
            vendor: vendor.into(),
        }
    }

    /// Create an InvalidRequest error
    pub fn invalid_request(container: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            container: container.into(),
            reason: reason.into(),
        }
    }

    /// Create an AllocationNotFound error
    pub fn allocation_not_found(pod: impl Into<String>, vendor: impl Into<String>) -> Self {
        Self::AllocationNotFound {
            pod: pod.into(),
            vendor: vendor.into(),
        }
    }
}
