//! # tagwire
//!
//! Tagged messaging between peers over TCP streams and UDP datagrams.
//!
//! Every message is a frame carrying a short UTF-8 tag, a kind (`Send`, `Request`
//! or `Response`) and an optional opaque payload. Applications register handlers per
//! tag; requests are correlated with their responses by tag, one in flight per tag.
//!
//! ## Layout
//! - [`core`]: packet envelope, stream reassembly, codec, payload serialization
//! - [`protocol`]: endpoint registry, request correlation, client and server cores
//! - [`transport`]: TCP and UDP sessions, live-peer table, NAT rendezvous
//! - [`config`], [`utils`]: configuration, logging, metrics, timeouts
//!
//! ## Quick Start
//! ```no_run
//! # async fn run() -> tagwire::Result<()> {
//! use tagwire::{NetworkConfig, TcpServer};
//!
//! let server = TcpServer::new(NetworkConfig::default());
//! let owner = server.registry().owner();
//! server
//!     .registry()
//!     .on_request::<String, String, _>(owner, "echo", |_peer, msg| msg)?;
//! let addr = server.listen().await?;
//! println!("listening on {addr}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use core::packet::{Packet, PacketKind};
pub use core::peer::PeerId;
pub use core::serialization::{SerializationFormat, Serializer};
pub use error::{NetError, Result};
pub use protocol::client::ClientCore;
pub use protocol::dispatcher::{ClientRegistry, NatRelayTarget, OwnerHandle, ServerRegistry};
pub use protocol::handshake::{ConnectStatus, ConnectionState, DisconnectReason};
pub use protocol::server::ServerCore;
pub use transport::tcp::{TcpClient, TcpServer};
pub use transport::udp::{NatPairing, UdpClient, UdpServer};
pub use transport::DeliveryMethod;
