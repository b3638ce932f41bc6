//! # Error Types
//!
//! Custom error types for Dash Bridge using `thiserror`.

use thiserror::Error;

/// Main error type for Dash Bridge
#[derive(Debug, Error)]
pub enum DashBridgeError {
    /// Telemetry record decode errors
    #[error("telemetry record error: {0}")]
    Record(String),

    /// Shared memory acquisition errors (transient while the simulator is starting)
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    /// Serial port errors
    #[error("serial error: {0}")]
    Serial(String),

    /// Provisioning requests rejected up front (bad input or a conflicting job)
    #[error("provisioning rejected: {0}")]
    ProvisionRejected(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Dash Bridge
pub type Result<T> = std::result::Result<T, DashBridgeError>;
