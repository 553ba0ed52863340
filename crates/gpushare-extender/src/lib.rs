//! gpushare Extender - Kubernetes scheduler extender HTTP server
//!
//! This crate provides:
//! - Axum-based HTTP server
//! - Filter and bind endpoints speaking the extender v1 wire format
//! - Health and readiness probes
//! - A read-only view of node device usage

pub mod error;
pub mod handlers;
pub mod response;
pub mod server;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use error::{ApiError, Result};
pub use server::{ApiServer, Config};
pub use state::AppState;
pub use types::{ExtenderArgs, ExtenderBindingArgs, ExtenderBindingResult, ExtenderFilterResult};
