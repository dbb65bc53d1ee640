//! Host/guest network configuration protocol.
//!
//! The host drives guest networking over a private duplex channel and the
//! guest reports port binds back over a second one. Both directions use the
//! same framing.
//!
//! # Framing
//!
//! ```text
//! | type (4) | size (4) | kind-specific fields | payload (var) | NUL (1) |
//! ```
//! - type: message kind (little-endian u32, see [`MessageType`])
//! - size: total frame length including the trailing NUL (little-endian u32)
//! - payload: UTF-8 text, usually a JSON document from [`schema`]
//!
//! Every request is answered with a [`MessageType::Result`] frame carrying a
//! little-endian `i32`; zero means success.

pub mod message;
pub mod schema;

pub use message::{
    decode, encode, Message, MessageHeader, MessageType, PortAllocationRequest, HEADER_SIZE,
    MAX_MESSAGE_SIZE, RESULT_CALLBACK_FAILED, RESULT_NO_RESPONSE, RESULT_SHUTDOWN_IN_PROGRESS,
};
