//! # Error Types
//!
//! Error taxonomy for the telemetry engine using `thiserror`.
//!
//! Only consumer-invoked operations (scan, connect, trip reset, settings
//! updates) return these
//! errors. Decode, storage and sensor failures are absorbed where they occur
//! and only show up in the operational log.

use thiserror::Error;

use crate::connection::ConnectionState;

/// Main error type for the telemetry engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Location or radio permission denied
    #[error("permission denied: {0}")]
    Permission(String),

    /// Platform scan failure
    #[error("scan error: {0}")]
    Scan(String),

    /// Radio connect failure or cancelled connection attempt
    #[error("connection error: {0}")]
    Connection(String),

    /// Service or characteristic enumeration failure
    #[error("service discovery error: {0}")]
    ServiceDiscovery(String),

    /// A single authentication strategy failed
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Frame could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Durable storage read or write failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Custom link settings rejected before they were applied
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Operation requires an active monitoring session
    #[error("not connected")]
    NotConnected,

    /// Event not accepted in the current connection state
    #[error("invalid transition from {from:?} on {event}")]
    InvalidTransition {
        from: ConnectionState,
        event: String,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Snapshot or settings serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the telemetry engine
pub type Result<T> = std::result::Result<T, EngineError>;
