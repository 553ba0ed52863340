// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for gpushare data model operations
#[derive(Error, Debug, Diagnostic)]
pub enum CoreError {
    /// An annotation value could not be decoded
    #[error("Failed to decode annotation {key}: {reason}")]
    #[diagnostic(
        code(gpushare::annotation_decode),
        help("Annotations under the gpushare keys are written by the scheduler and device plugin only; check for manual edits of the pod or node")
    )]
    AnnotationDecode {
        #[allow(unused)]
        key: String,
        #[allow(unused)]
        reason: String,
    },

    /// A value cannot be written into the delimited annotation format
    #[error("Failed to encode annotation: {reason}")]
    #[diagnostic(
        code(gpushare::annotation_encode),
        help("Device UUIDs and type names must not contain ',', ':' or ';'")
    )]
    AnnotationEncode {
        #[allow(unused)]
        reason: String,
    },

    /// A resource quantity could not be parsed
    #[error("Invalid quantity '{value}': {reason}")]
    #[diagnostic(
        code(gpushare::invalid_quantity),
        help("Use a Kubernetes quantity such as '3000', '4Gi' or '1k'")
    )]
    InvalidQuantity {
        #[allow(unused)]
        value: String,
        #[allow(unused)]
        reason: String,
    },

    /// An annotation carries a value outside its allowed set
    #[error("Invalid value '{value}' for {key}")]
    #[diagnostic(
        code(gpushare::invalid_annotation_value),
        help("Allowed values: {allowed}")
    )]
    InvalidAnnotationValue {
        #[allow(unused)]
        key: String,
        #[allow(unused)]
        value: String,
        #[allow(unused)]
        allowed: String,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create an AnnotationDecode error
    pub fn annotation_decode(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AnnotationDecode {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an AnnotationEncode error
    pub fn annotation_encode(reason: impl Into<String>) -> Self {
        Self::AnnotationEncode {
            reason: reason.into(),
        }
    }

    /// Create an InvalidQuantity error
    pub fn invalid_quantity(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQuantity {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidAnnotationValue error
    pub fn invalid_annotation_value(
        key: impl Into<String>,
        value: impl Into<String>,
        allowed: impl Into<String>,
    ) -> Self {
        Self::InvalidAnnotationValue {
            key: key.into(),
            value: value.into(),
            allowed: allowed.into(),
        }
    }
}
