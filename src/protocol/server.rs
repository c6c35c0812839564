//! Server core shared by the stream and datagram servers.
//!
//! Owns the registry, the live-peer table, the serializer and metrics. Transports
//! admit sessions through [`ServerCore::admit`] and [`ServerCore::announce`] and
//! forward what they read through the [`PacketSink`] implementation below.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::packet::{Packet, PacketKind};
use crate::core::peer::PeerId;
use crate::core::serialization::{SerializationFormat, Serializer};
use crate::error::{NetError, Result};
use crate::protocol::dispatcher::{offload, ServerRegistry};
use crate::protocol::events::{self, NetEvent};
use crate::protocol::handshake::DisconnectReason;
use crate::transport::peers::{Admission, PeerTable};
use crate::transport::{Link, PacketSink};
use crate::utils::metrics::Metrics;

pub struct ServerCore {
    registry: Arc<ServerRegistry>,
    peers: PeerTable,
    serializer: Serializer,
    metrics: Arc<Metrics>,
}

impl ServerCore {
    pub fn new(max_peers: usize) -> Self {
        let serializer = Serializer::default();
        let metrics = Arc::new(Metrics::new());
        Self {
            registry: Arc::new(ServerRegistry::new(serializer.clone(), metrics.clone())),
            peers: PeerTable::new(max_peers),
            serializer,
            metrics,
        }
    }

    /// Endpoint registration
    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    pub fn set_serializer(&self, format: SerializationFormat) {
        self.serializer.set_format(format);
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.peers()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    /// Reserve a slot in the live-peer table for a new session
    pub fn admit(&self, link: Arc<dyn Link>) -> Admission {
        let peer = link.peer_id();
        let admission = self.peers.try_insert(link);
        match admission {
            Admission::Admitted => self.metrics.connection_established(),
            Admission::Full => {
                self.metrics.connection_rejected();
                info!(%peer, capacity = self.peers.capacity(), "Connection rejected, server full");
            }
            Admission::Duplicate => debug!(%peer, "Peer already connected"),
        }
        admission
    }

    /// Give back a slot taken by [`ServerCore::admit`] for a session that never started
    pub fn release(&self, link: &Arc<dyn Link>) {
        if self.peers.remove_link(link) {
            self.metrics.connection_closed();
        }
    }

    /// Tell connect handlers about an admitted session
    pub async fn announce(&self, peer: PeerId) {
        events::record(NetEvent::Connect, Some(&peer), None, None);
        let registry = self.registry.clone();
        offload(move || registry.dispatch_connect(&peer)).await;
    }

    pub async fn send_to_raw(&self, peer: &PeerId, tag: &str, payload: Option<Bytes>) -> Result<()> {
        let link = self.peers.get(peer).ok_or(NetError::NotConnected)?;
        let packet = Packet::send(tag, payload);
        let len = packet.encoded_len() as u64;
        link.send_packet(packet.clone()).await?;
        self.metrics.packet_sent(len);
        events::record(NetEvent::Send, Some(peer), Some(&packet), None);
        Ok(())
    }

    /// Send an encoded value to one peer
    pub async fn send_to<T: Serialize + ?Sized>(
        &self,
        peer: &PeerId,
        tag: &str,
        payload: Option<&T>,
    ) -> Result<()> {
        let bytes = self.serializer.encode_optional(payload)?;
        self.send_to_raw(peer, tag, bytes).await
    }

    /// Send raw bytes to every peer but `except`.
    ///
    /// `Ok(false)` when at least one peer could not be reached.
    pub async fn broadcast_except_raw(
        &self,
        except: Option<&PeerId>,
        tag: &str,
        payload: Option<Bytes>,
    ) -> Result<bool> {
        let packet = Packet::send(tag, payload);
        packet.validate()?;
        let all_sent = self.peers.broadcast_except(except, &packet).await;
        events::record(NetEvent::Send, None, Some(&packet), None);
        Ok(all_sent)
    }

    pub async fn broadcast<T: Serialize + ?Sized>(&self, tag: &str, payload: Option<&T>) -> Result<bool> {
        let bytes = self.serializer.encode_optional(payload)?;
        self.broadcast_except_raw(None, tag, bytes).await
    }

    pub async fn broadcast_except<T: Serialize + ?Sized>(
        &self,
        except: &PeerId,
        tag: &str,
        payload: Option<&T>,
    ) -> Result<bool> {
        let bytes = self.serializer.encode_optional(payload)?;
        self.broadcast_except_raw(Some(except), tag, bytes).await
    }

    /// Drop one peer from this side. Disconnect handlers see `LocalClose`.
    pub async fn disconnect_peer(&self, peer: &PeerId) -> bool {
        match self.peers.remove(peer) {
            Some(link) => {
                self.finish(peer, DisconnectReason::LocalClose);
                link.close().await;
                true
            }
            None => false,
        }
    }

    /// Drop every peer from this side
    pub async fn disconnect_all(&self) -> usize {
        let links = self.peers.drain();
        let count = links.len();
        for link in links {
            let peer = link.peer_id();
            self.finish(&peer, DisconnectReason::LocalClose);
            link.close().await;
        }
        count
    }

    fn finish(&self, peer: &PeerId, reason: DisconnectReason) {
        self.metrics.connection_closed();
        info!(%peer, ?reason, "Peer disconnected");
        events::record(NetEvent::Disconnect, Some(peer), None, None);
        self.registry.dispatch_disconnect(peer, reason);
    }

    /// Answer a request with exactly one response.
    ///
    /// The response is empty when no endpoint answered, or when the reply could not
    /// be put on the wire (too large for the transport, for instance).
    async fn answer(&self, link: &Arc<dyn Link>, request: Packet) {
        let peer = link.peer_id();
        events::record(NetEvent::RequestFrom, Some(&peer), Some(&request), None);

        let tag = request.tag.clone();
        let registry = self.registry.clone();
        let reply = offload(move || registry.dispatch_request(&peer, &request))
            .await
            .flatten();

        let unsendable = match self.respond(link, Packet::response(tag.clone(), reply)).await {
            Ok(()) => return,
            Err(e) if reply_rejected(&e) => e,
            Err(e) => {
                warn!(%peer, %tag, error = %e, "Failed to send response");
                return;
            }
        };

        let failure = NetError::Dispatch(format!("reply to '{tag}' not sent: {unsendable}"));
        self.metrics.dispatch_error();
        events::record(NetEvent::HandlerFailure, Some(&peer), None, Some(&failure));
        if let Err(e) = self.respond(link, Packet::response(tag.clone(), None)).await {
            warn!(%peer, %tag, error = %e, "Failed to send empty response");
        }
    }

    async fn respond(&self, link: &Arc<dyn Link>, response: Packet) -> Result<()> {
        let len = response.encoded_len() as u64;
        link.send_packet(response.clone()).await?;
        self.metrics.packet_sent(len);
        events::record(NetEvent::ResponseTo, Some(&link.peer_id()), Some(&response), None);
        Ok(())
    }
}

/// Errors caused by the reply itself rather than by the session
fn reply_rejected(error: &NetError) -> bool {
    matches!(
        error,
        NetError::OversizedPacket(_) | NetError::TagTooLong(_) | NetError::Serialization { .. }
    )
}

impl PacketSink for ServerCore {
    fn resolve(&self, _packet: &Packet) -> bool {
        false
    }

    fn handle<'a>(&'a self, link: &'a Arc<dyn Link>, packet: Packet) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let peer = link.peer_id();
            self.metrics.packet_received(packet.encoded_len() as u64);
            match packet.kind {
                PacketKind::Send => {
                    events::record(NetEvent::Receive, Some(&peer), Some(&packet), None);
                    let registry = self.registry.clone();
                    offload(move || registry.dispatch_send(&peer, &packet)).await;
                }
                PacketKind::Request => self.answer(link, packet).await,
                PacketKind::Response => {
                    // Servers never issue requests
                    self.metrics.protocol_error();
                    let err = NetError::MalformedFrame(format!(
                        "unexpected response '{}' from client",
                        packet.tag
                    ));
                    events::record(NetEvent::MalformedPacket, Some(&peer), Some(&packet), Some(&err));
                }
            }
        })
    }

    fn malformed(&self, peer: &PeerId, error: &NetError) {
        self.metrics.protocol_error();
        events::record(NetEvent::MalformedPacket, Some(peer), None, Some(error));
    }

    fn ended(&self, link: &Arc<dyn Link>, reason: DisconnectReason) {
        if self.peers.remove_link(link) {
            self.finish(&link.peer_id(), reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct ChannelLink {
        peer: PeerId,
        open: AtomicBool,
        tx: mpsc::UnboundedSender<Packet>,
    }

    impl Link for ChannelLink {
        fn peer_id(&self) -> PeerId {
            self.peer
        }

        fn send_packet(&self, packet: Packet) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                packet.validate()?;
                self.tx.send(packet).map_err(|_| NetError::NotConnected)
            })
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            self.open.store(false, Ordering::SeqCst);
            Box::pin(async {})
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    fn link(port: u16) -> (Arc<dyn Link>, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link: Arc<dyn Link> = Arc::new(ChannelLink {
            peer: PeerId::new([127, 0, 0, 1].into(), port),
            open: AtomicBool::new(true),
            tx,
        });
        (link, rx)
    }

    #[tokio::test]
    async fn unknown_request_gets_empty_response() {
        let core = ServerCore::new(4);
        let (link, mut rx) = link(1);
        assert_eq!(core.admit(link.clone()), Admission::Admitted);

        core.handle(&link, Packet::request("nobody", Some(Bytes::from_static(b"x"))))
            .await;
        let response = rx.recv().await.unwrap();
        assert_eq!(response.kind, PacketKind::Response);
        assert_eq!(response.tag, "nobody");
        assert!(response.payload.is_none());
    }

    #[tokio::test]
    async fn unsendable_reply_becomes_empty_response() {
        let core = ServerCore::new(4);
        let owner = core.registry().owner();
        core.registry()
            .on_request_raw(owner, "big", |_, _| Some(Bytes::from(vec![1u8; 70_000])))
            .unwrap();
        let (link, mut rx) = link(2);
        core.admit(link.clone());

        core.handle(&link, Packet::request("big", None)).await;
        let response = rx.recv().await.unwrap();
        assert_eq!(response.kind, PacketKind::Response);
        assert_eq!(response.tag, "big");
        assert!(response.payload.is_none());
        assert!(rx.try_recv().is_err());
        assert_eq!(core.metrics().snapshot().dispatch_errors, 1);
    }

    #[tokio::test]
    async fn full_server_rejects_and_counts() {
        let core = ServerCore::new(1);
        let (a, _ra) = link(1);
        let (b, _rb) = link(2);
        assert_eq!(core.admit(a), Admission::Admitted);
        assert_eq!(core.admit(b), Admission::Full);
        assert_eq!(core.metrics().snapshot().connections_rejected, 1);
        assert_eq!(core.peer_count(), 1);
    }

    #[tokio::test]
    async fn session_end_after_local_disconnect_is_silent() {
        let core = ServerCore::new(4);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        core.registry()
            .on_disconnect(core.registry().owner(), move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let (l, _rx) = link(5);
        core.admit(l.clone());
        assert!(core.disconnect_peer(&l.peer_id()).await);
        core.ended(&l, DisconnectReason::RemoteConnectionClose);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!l.is_open());
    }

    #[tokio::test]
    async fn send_to_unknown_peer_is_not_connected() {
        let core = ServerCore::new(4);
        let peer = PeerId::new([10, 0, 0, 1].into(), 9);
        assert!(matches!(
            core.send_to_raw(&peer, "x", None).await,
            Err(NetError::NotConnected)
        ));
    }
}
