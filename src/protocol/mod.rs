//! # Protocol Layer
//!
//! Transport-agnostic session logic: endpoint registration and dispatch, request
//! correlation, the accept handshake, structured events, and the client and server
//! cores every transport drives.

pub mod client;
pub mod correlation;
pub mod dispatcher;
pub mod events;
pub mod handshake;
pub mod server;
