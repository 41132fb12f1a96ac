//! Shared error taxonomy and observability setup for the Detector services

// Re-export common dependencies
pub use thiserror;
pub use tracing;

pub mod observability;
pub mod types;

pub use types::error::{DetectorError, ErrorClass};

pub type Result<T> = std::result::Result<T, DetectorError>;
