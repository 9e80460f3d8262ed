//! Error types for the event bus.

use thiserror::Error;

/// Main error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid filter {query:?}: {reason}")]
    InvalidFilter { query: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Subscriber connection closed")]
    SubscriberClosed,
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BusError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BusError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BusError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BusError::Deserialization(e.to_string())
    }
}

/// Why a push to a single subscriber failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The peer hung up; nothing more can be delivered.
    #[error("subscriber disconnected")]
    Disconnected,

    /// The subscriber's buffer is full (slow consumer).
    #[error("subscriber buffer full")]
    Full,

    /// The event could not be rendered for this subscriber.
    #[error("failed to render event: {0}")]
    Serialization(String),
}

impl SinkError {
    /// Whether the subscriber must be closed after this failure.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SinkError::Serialization(_))
    }
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
