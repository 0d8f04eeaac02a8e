#![forbid(unsafe_code)]
//! Error types for Grist.
//!
//! Defines `GristError` and a `Result<T>` alias used throughout the
//! workspace. Invariant violations are not represented here: they denote
//! corruption or programming errors and panic after logging.

use thiserror::Error;

/// Unified error type for all Grist operations.
#[derive(Debug, Error)]
pub enum GristError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] grist_types::ConfigError),

    #[error("invalid request: {0}")]
    Format(String),

    #[error("no space left in the data block region")]
    NoSpace,

    #[error("manager is shut down")]
    ShutDown,
}

/// Result alias using `GristError`.
pub type Result<T> = std::result::Result<T, GristError>;
