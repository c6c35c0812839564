//! # Error Types
//!
//! Error handling for framing, dispatch, correlation and transports.
//!
//! ## Error Categories
//! - **Protocol errors**: malformed or truncated frames, oversized packets and tags.
//!   The offending packet is dropped and the session keeps running.
//! - **Serialization errors**: payload encode/decode failures. Surfaced to the caller
//!   of `send`/`request`, logged for inbound traffic.
//! - **Dispatch errors**: registration conflicts and handler panics.
//! - **Request errors**: timeouts, duplicate in-flight tags, cancellation.
//! - **Connection errors**: I/O failures, closed sessions, handshake rejections.
//!
//! ## Example Usage
//! ```rust
//! use tagwire::error::{NetError, Result};
//!
//! fn check_tag(tag: &str) -> Result<()> {
//!     if tag.len() > 255 {
//!         return Err(NetError::TagTooLong(tag.len()));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_tag("echo").is_ok());
//! ```

use std::io;
use thiserror::Error;

use crate::protocol::handshake::ConnectStatus;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Registry lock errors
    pub const ERR_REGISTRY_WRITE_LOCK: &str = "Failed to acquire write lock on endpoint registry";
    pub const ERR_REGISTRY_READ_LOCK: &str = "Failed to acquire read lock on endpoint registry";

    /// Frame validation errors
    pub const ERR_TRUNCATED_HEADER: &str = "Frame shorter than its header";
    pub const ERR_LENGTH_MISMATCH: &str = "Frame length field does not match frame size";
    pub const ERR_TAG_OVERRUN: &str = "Tag length exceeds frame body";
    pub const ERR_TAG_NOT_UTF8: &str = "Tag is not valid UTF-8";

    /// Registration errors
    pub const ERR_EMPTY_TAG: &str = "Endpoint tag cannot be empty";
    pub const ERR_NAT_RELAY_TAKEN: &str = "A NAT relay handler is already registered";
}

/// NetError is the error type for every fallible operation in the crate
#[derive(Error, Debug)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Tag too long: {0} bytes (maximum 255)")]
    TagTooLong(usize),

    #[error("Serialization error for {type_name}: {reason}")]
    Serialization {
        type_name: &'static str,
        reason: String,
        /// Offending bytes when the failure happened while decoding
        bytes: Option<Vec<u8>>,
    },

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Timed out waiting for '{0}'")]
    Timeout(String),

    #[error("A request with tag '{0}' is already in flight")]
    DuplicateRequest(String),

    #[error("Request '{0}' was cancelled")]
    Cancelled(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection rejected: {0:?}")]
    Handshake(ConnectStatus),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl NetError {
    /// True for errors that only invalidate a single packet, never the session
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            NetError::MalformedFrame(_) | NetError::OversizedPacket(_) | NetError::TagTooLong(_)
        )
    }
}

impl From<bincode::Error> for NetError {
    fn from(e: bincode::Error) -> Self {
        NetError::Serialization {
            type_name: "engine datagram",
            reason: e.to_string(),
            bytes: None,
        }
    }
}

/// Type alias for Results using NetError
pub type Result<T> = std::result::Result<T, NetError>;
