//! Error types for guestnet.

use std::net::IpAddr;

use thiserror::Error;

use crate::protocol::MessageType;

/// Result type alias using guestnet's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or serving a guest's network.
#[derive(Error, Debug)]
pub enum Error {
    // Framing errors
    #[error("message encoding failed: {0}")]
    Encoding(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unexpected message type: {0}")]
    UnexpectedMessageType(u32),

    // Guest errors
    #[error("guest exited without answering {message_type:?}")]
    UnexpectedGuestExit { message_type: MessageType },

    #[error("guest rejected {message_type:?} with result {code}")]
    GuestRejected { message_type: MessageType, code: i32 },

    // Engine errors
    #[error("networking engine is not configured: missing {0}")]
    NotConfigured(&'static str),

    #[error("invalid engine state: {0}")]
    InvalidState(&'static str),

    #[error("host connectivity changed while resolving the interface for {address}")]
    RetryableConnectivityChanged { address: IpAddr },

    #[error("guest device error: {0}")]
    Device(String),

    #[error("host network error: {0}")]
    HostNetwork(String),

    // Configuration errors
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn device(msg: impl Into<String>) -> Self {
        Error::Device(msg.into())
    }

    pub fn host(msg: impl Into<String>) -> Self {
        Error::HostNetwork(msg.into())
    }

    /// Whether the failed operation should be restarted on the next
    /// connectivity event rather than treated as permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RetryableConnectivityChanged { .. })
    }
}
