//! # Transport Layer
//!
//! Stream (TCP) and datagram (UDP) sessions. Both transports expose a session to the
//! shared client and server cores as a [`Link`], and feed inbound packets back
//! through a [`PacketSink`], so request correlation, dispatch and lifecycle handling
//! are written once.
//!
//! ## Components
//! - **tcp**: stream client/server with length-prefixed framing and an accept status
//! - **udp**: datagram engine with per-send delivery guarantees and NAT rendezvous
//! - **peers**: live-peer table with capacity and broadcast fan-out

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::core::packet::Packet;
use crate::core::peer::PeerId;
use crate::error::{NetError, Result};
use crate::protocol::handshake::DisconnectReason;

pub mod peers;
pub mod tcp;
pub mod udp;

/// One open session with a remote peer
pub trait Link: Send + Sync {
    /// Identity of the remote side
    fn peer_id(&self) -> PeerId;

    /// Queue one packet for the remote side
    fn send_packet(&self, packet: Packet) -> BoxFuture<'_, Result<()>>;

    /// Tear down the underlying connection.
    ///
    /// Does not notify handlers; lifecycle events flow through [`PacketSink::ended`].
    fn close(&self) -> BoxFuture<'_, ()>;

    fn is_open(&self) -> bool;
}

/// Receives what a session reads
pub trait PacketSink: Send + Sync + 'static {
    /// Fast path run on the reader task. Returns `true` when the packet was consumed
    /// (a `Response` matched to a pending request) and must not be queued.
    fn resolve(&self, packet: &Packet) -> bool;

    /// Deliver a packet in arrival order, from the session's dispatch task
    fn handle<'a>(&'a self, link: &'a Arc<dyn Link>, packet: Packet) -> BoxFuture<'a, ()>;

    /// A frame from `peer` could not be decoded and was dropped
    fn malformed(&self, peer: &PeerId, error: &NetError);

    /// The session ended. Called at most once per link.
    fn ended(&self, link: &Arc<dyn Link>, reason: DisconnectReason);
}

/// Delivery guarantee for one datagram send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeliveryMethod {
    /// Fire and forget; may be lost, duplicated or reordered
    Unreliable,
    /// Acknowledged and re-sent until acknowledged; duplicates suppressed
    ReliableUnordered,
    /// Reliable, and released to the application in send order
    #[default]
    ReliableOrdered,
}

impl DeliveryMethod {
    pub fn is_reliable(self) -> bool {
        !matches!(self, DeliveryMethod::Unreliable)
    }
}

/// Compare two links by allocation, ignoring vtables
pub(crate) fn same_link(a: &Arc<dyn Link>, b: &Arc<dyn Link>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
