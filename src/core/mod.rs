//! # Core Protocol Components
//!
//! Packet envelope, stream reassembly, tokio codec, peer identity and payload
//! serialization. Nothing in here touches a socket.
//!
//! ## Wire Format
//! ```text
//! [FrameLength(2, LE)] [TagLength(1)] [Kind(1)] [Tag] [Payload]
//! ```
//!
//! ## Limits
//! - Tags are at most 255 bytes of UTF-8
//! - A frame is at most 65535 bytes including its length prefix
//! - An empty payload is the same as no payload

pub mod codec;
pub mod packet;
pub mod peer;
pub mod reassembly;
pub mod serialization;
