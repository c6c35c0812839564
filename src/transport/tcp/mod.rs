//! # TCP Transport
//!
//! Length-prefixed frames over a stream. After accept the server writes a 4-byte
//! status; only an `Ok` status is followed by frames.

pub mod client;
pub mod server;
pub mod session;

pub use client::TcpClient;
pub use server::TcpServer;
pub use session::TcpLink;
