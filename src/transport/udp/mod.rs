//! # UDP Transport
//!
//! Sessions over datagrams, driven by [`UdpEngine`]. Each data datagram carries
//! exactly one frame in the same wire format as the stream transport.
//!
//! ## Components
//! - **engine**: socket task, handshake, delivery guarantees, keep-alive, NAT punch
//! - **client** / **server**: translate engine events into the shared cores
//! - **nat**: token-based pairing for the relay handler

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::trace;

use crate::core::packet::Packet;
use crate::core::peer::PeerId;
use crate::error::{NetError, Result};
use crate::protocol::handshake::DisconnectReason;
use crate::transport::{DeliveryMethod, Link, PacketSink};

pub mod client;
pub mod engine;
pub mod nat;
pub mod server;

pub use client::UdpClient;
pub use engine::{EngineEvent, EngineSettings, UdpEngine};
pub use nat::NatPairing;
pub use server::UdpServer;

/// One engine session seen as a [`Link`]
pub struct UdpLink {
    engine: Arc<UdpEngine>,
    peer: SocketAddr,
    delivery: DeliveryMethod,
    open: AtomicBool,
    close_notice: Option<mpsc::UnboundedSender<SocketAddr>>,
}

impl UdpLink {
    pub fn new(engine: Arc<UdpEngine>, peer: SocketAddr, delivery: DeliveryMethod) -> Self {
        Self {
            engine,
            peer,
            delivery,
            open: AtomicBool::new(true),
            close_notice: None,
        }
    }

    /// A link that reports its peer address on `notice` when closed from this side.
    ///
    /// The engine raises no event for a local disconnect, so this is how the owner
    /// learns about it.
    pub(crate) fn with_close_notice(
        engine: Arc<UdpEngine>,
        peer: SocketAddr,
        delivery: DeliveryMethod,
        notice: mpsc::UnboundedSender<SocketAddr>,
    ) -> Self {
        Self {
            close_notice: Some(notice),
            ..Self::new(engine, peer, delivery)
        }
    }

    /// Send with an explicit delivery method instead of the link default
    pub async fn send_with(&self, packet: Packet, method: DeliveryMethod) -> Result<()> {
        if !self.is_open() {
            return Err(NetError::NotConnected);
        }
        send_frame(&self.engine, self.peer, &packet, method).await
    }

    /// Mark the session gone without telling the remote side
    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Link for UdpLink {
    fn peer_id(&self) -> PeerId {
        PeerId::from(self.peer)
    }

    fn send_packet(&self, packet: Packet) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.send_with(packet, self.delivery))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.open.swap(false, Ordering::SeqCst) {
                self.engine.disconnect(self.peer).await;
                if let Some(notice) = &self.close_notice {
                    let _ = notice.send(self.peer);
                }
            }
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.engine.is_connected(&self.peer)
    }
}

/// Encode `packet` as one frame and hand it to the engine
pub(crate) async fn send_frame(
    engine: &UdpEngine,
    peer: SocketAddr,
    packet: &Packet,
    method: DeliveryMethod,
) -> Result<()> {
    let frame = packet.to_bytes()?;
    engine.send(peer, &frame, method).await
}

enum Inbound {
    Packet(Packet),
    Ended(DisconnectReason),
}

/// Dispatch queue of one datagram session.
///
/// The engine's event task only decodes frames and resolves responses. Everything
/// else goes through this bounded queue to a task of its own per session, so
/// handlers of one peer never delay another peer's traffic while arrival order
/// within the session is kept.
#[derive(Clone)]
pub(crate) struct SessionQueue {
    link: Arc<dyn Link>,
    tx: mpsc::Sender<Inbound>,
}

impl SessionQueue {
    /// Start the dispatch task; it runs `prelude` before the first packet
    pub(crate) fn spawn(
        link: Arc<dyn Link>,
        sink: Arc<dyn PacketSink>,
        limit: usize,
        prelude: BoxFuture<'static, ()>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel(limit.max(1));
        let session = link.clone();
        tokio::spawn(async move {
            prelude.await;
            while let Some(inbound) = rx.recv().await {
                match inbound {
                    Inbound::Packet(packet) => sink.handle(&session, packet).await,
                    Inbound::Ended(reason) => {
                        sink.ended(&session, reason);
                        break;
                    }
                }
            }
            trace!(peer = %session.peer_id(), "Session dispatch stopped");
        });
        Self { link, tx }
    }

    pub(crate) fn link(&self) -> &Arc<dyn Link> {
        &self.link
    }

    /// Decode one received datagram payload and route it.
    ///
    /// A full queue pushes back on the caller.
    pub(crate) async fn deliver(&self, sink: &dyn PacketSink, frame: &[u8]) {
        let peer = self.link.peer_id();
        match Packet::from_bytes(frame) {
            Ok(packet) => {
                if sink.resolve(&packet) {
                    return;
                }
                if self.tx.send(Inbound::Packet(packet)).await.is_err() {
                    trace!(%peer, "Session dispatch gone, packet dropped");
                }
            }
            Err(e) => {
                trace!(%peer, error = %e, "Undecodable frame in datagram");
                sink.malformed(&peer, &e);
            }
        }
    }

    /// Report the end of the session once everything queued before it was handled
    pub(crate) async fn end(self, reason: DisconnectReason) {
        if self.tx.send(Inbound::Ended(reason)).await.is_err() {
            trace!(peer = %self.link.peer_id(), "Session dispatch gone before its end");
        }
    }
}

/// Local bind address able to reach `remote`
pub(crate) fn bind_address_for(remote: &SocketAddr) -> SocketAddr {
    use std::net::{Ipv4Addr, Ipv6Addr};

    let ip = match (remote.is_ipv4(), remote.ip().is_loopback()) {
        (true, true) => Ipv4Addr::LOCALHOST.into(),
        (true, false) => Ipv4Addr::UNSPECIFIED.into(),
        (false, true) => Ipv6Addr::LOCALHOST.into(),
        (false, false) => Ipv6Addr::UNSPECIFIED.into(),
    };
    SocketAddr::new(ip, 0)
}

/// First address `address` resolves to
pub(crate) async fn resolve(address: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| NetError::Config(format!("address '{address}' did not resolve")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_servers_get_loopback_binds() {
        let v4: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(bind_address_for(&v4), "127.0.0.1:0".parse().unwrap());
        let public: SocketAddr = "203.0.113.5:9000".parse().unwrap();
        assert_eq!(bind_address_for(&public), "0.0.0.0:0".parse().unwrap());
        let v6: SocketAddr = "[::1]:9000".parse().unwrap();
        assert_eq!(bind_address_for(&v6), "[::1]:0".parse().unwrap());
    }

    #[tokio::test]
    async fn literal_addresses_resolve() {
        let addr = resolve("127.0.0.1:4000").await.unwrap();
        assert_eq!(addr.port(), 4000);
    }
}
