//! Client session core shared by the stream and datagram clients.
//!
//! Owns the registry, the request tracker, the serializer and the connection
//! state. A transport attaches a [`Link`] once connected and forwards what it reads
//! through the [`PacketSink`] implementation below.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::core::packet::{Packet, PacketKind};
use crate::core::peer::PeerId;
use crate::core::serialization::{SerializationFormat, Serializer};
use crate::error::{NetError, Result};
use crate::protocol::correlation::RequestTracker;
use crate::protocol::dispatcher::{offload, ClientRegistry};
use crate::protocol::events::{self, NetEvent};
use crate::protocol::handshake::{ConnectionState, DisconnectReason};
use crate::transport::{same_link, Link, PacketSink};
use crate::utils::metrics::Metrics;

pub struct ClientCore {
    registry: Arc<ClientRegistry>,
    tracker: RequestTracker,
    serializer: Serializer,
    metrics: Arc<Metrics>,
    state: Mutex<ConnectionState>,
    link: RwLock<Option<Arc<dyn Link>>>,
    request_timeout: Duration,
    // Guards the single disconnect notification per attached link
    live: AtomicBool,
}

impl Default for ClientCore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientCore {
    pub fn new() -> Self {
        Self::with_request_timeout(ClientConfig::default().request_timeout)
    }

    /// Core whose [`ClientCore::request_default`] waits `request_timeout`
    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        let serializer = Serializer::default();
        let metrics = Arc::new(Metrics::new());
        Self {
            registry: Arc::new(ClientRegistry::new(serializer.clone(), metrics.clone())),
            tracker: RequestTracker::new(),
            serializer,
            metrics,
            state: Mutex::new(ConnectionState::Disconnected),
            link: RwLock::new(None),
            request_timeout,
            live: AtomicBool::new(false),
        }
    }

    /// Endpoint registration
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    /// Swap the payload format for every later send, request and typed handler
    pub fn set_serializer(&self, format: SerializationFormat) {
        self.serializer.set_format(format);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Remote peer of the current session
    pub fn server_id(&self) -> Option<PeerId> {
        self.current_link().map(|link| link.peer_id())
    }

    /// Record a state change made by the transport during connect
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Attach a freshly connected session
    pub fn attach(&self, link: Arc<dyn Link>) {
        let peer = link.peer_id();
        *self.link.write().unwrap_or_else(PoisonError::into_inner) = Some(link);
        self.live.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        self.metrics.connection_established();
        events::record(NetEvent::Connect, Some(&peer), None, None);
    }

    /// The attached session, if any
    pub fn link(&self) -> Option<Arc<dyn Link>> {
        self.current_link()
    }

    fn current_link(&self) -> Option<Arc<dyn Link>> {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn connected_link(&self) -> Result<Arc<dyn Link>> {
        match self.current_link() {
            Some(link) if self.is_connected() && link.is_open() => Ok(link),
            _ => Err(NetError::NotConnected),
        }
    }

    /// Fire-and-forget send of raw payload bytes
    pub async fn send_raw(&self, tag: &str, payload: Option<Bytes>) -> Result<()> {
        let link = self.connected_link()?;
        let packet = Packet::send(tag, payload);
        let peer = link.peer_id();
        let len = packet.encoded_len() as u64;
        link.send_packet(packet.clone()).await?;
        self.metrics.packet_sent(len);
        events::record(NetEvent::Send, Some(&peer), Some(&packet), None);
        Ok(())
    }

    /// Fire-and-forget send of an encoded value
    pub async fn send<T: Serialize + ?Sized>(&self, tag: &str, payload: Option<&T>) -> Result<()> {
        let bytes = self.serializer.encode_optional(payload)?;
        self.send_raw(tag, bytes).await
    }

    /// Send a request and wait for the response with the same tag.
    ///
    /// At most one request per tag may be outstanding; a second one fails with
    /// [`NetError::DuplicateRequest`] without touching the wire.
    pub async fn request_raw(
        &self,
        tag: &str,
        payload: Option<Bytes>,
        timeout: Duration,
    ) -> Result<Option<Bytes>> {
        let link = self.connected_link()?;
        let peer = link.peer_id();
        let pending = self.tracker.begin(tag)?;

        let packet = Packet::request(tag, payload);
        let len = packet.encoded_len() as u64;
        // A failed send drops `pending`, releasing the tag
        link.send_packet(packet.clone()).await?;
        self.metrics.packet_sent(len);
        self.metrics.request_sent();
        events::record(NetEvent::RequestTo, Some(&peer), Some(&packet), None);

        match pending.wait(timeout).await {
            Ok(reply) => {
                let response = Packet::response(tag, reply.clone());
                events::record(NetEvent::ResponseFrom, Some(&peer), Some(&response), None);
                Ok(reply)
            }
            Err(e) => {
                if matches!(e, NetError::Timeout(_)) {
                    self.metrics.request_timed_out();
                }
                debug!(%peer, tag, error = %e, "Request failed");
                Err(e)
            }
        }
    }

    /// Typed request: encodes `payload`, decodes the reply as `R`
    pub async fn request<T, R>(
        &self,
        tag: &str,
        payload: Option<&T>,
        timeout: Duration,
    ) -> Result<Option<R>>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let bytes = self.serializer.encode_optional(payload)?;
        let reply = self.request_raw(tag, bytes, timeout).await?;
        self.serializer.decode_optional(reply.as_ref())
    }

    /// Typed request using the configured request timeout
    pub async fn request_default<T, R>(&self, tag: &str, payload: Option<&T>) -> Result<Option<R>>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.request(tag, payload, self.request_timeout).await
    }

    /// End the current session from this side.
    ///
    /// Disconnect handlers see `LocalClose`. Returns `false` when there was no
    /// live session.
    pub async fn close(&self) -> bool {
        let link = self.current_link();
        let closed = self.finish(DisconnectReason::LocalClose);
        if let Some(link) = link {
            link.close().await;
        }
        closed
    }

    /// Tear down the session state once; later calls are no-ops
    fn finish(&self, reason: DisconnectReason) -> bool {
        if !self.live.swap(false, Ordering::SeqCst) {
            return false;
        }

        let peer = self
            .link
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|link| link.peer_id());
        self.set_state(ConnectionState::Disconnected);
        let cancelled = self.tracker.cancel_all();
        self.metrics.connection_closed();

        info!(peer = ?peer, ?reason, cancelled, "Client session ended");
        events::record(NetEvent::Disconnect, peer.as_ref(), None, None);
        self.registry.dispatch_disconnect(reason);
        true
    }
}

impl PacketSink for ClientCore {
    fn resolve(&self, packet: &Packet) -> bool {
        if packet.kind != PacketKind::Response {
            return false;
        }
        self.metrics.packet_received(packet.encoded_len() as u64);
        self.tracker.resolve(&packet.tag, packet.payload.clone());
        true
    }

    fn handle<'a>(&'a self, link: &'a Arc<dyn Link>, packet: Packet) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let peer = link.peer_id();
            match packet.kind {
                PacketKind::Send => {
                    self.metrics.packet_received(packet.encoded_len() as u64);
                    events::record(NetEvent::Receive, Some(&peer), Some(&packet), None);
                    let registry = self.registry.clone();
                    offload(move || registry.dispatch_send(&packet)).await;
                }
                PacketKind::Response => {
                    self.resolve(&packet);
                }
                PacketKind::Request => {
                    // Servers never issue requests
                    self.metrics.protocol_error();
                    let err = NetError::MalformedFrame(format!(
                        "unexpected request '{}' from server",
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
        let current = self.current_link();
        if current.is_some_and(|current| same_link(&current, link)) {
            self.finish(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Link that hands every sent packet to a channel
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

    fn connected() -> (Arc<ClientCore>, Arc<dyn Link>, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link: Arc<dyn Link> = Arc::new(ChannelLink {
            peer: "127.0.0.1:4000".parse::<std::net::SocketAddr>().unwrap().into(),
            open: AtomicBool::new(true),
            tx,
        });
        let core = Arc::new(ClientCore::new());
        core.attach(link.clone());
        (core, link, rx)
    }

    #[tokio::test]
    async fn send_without_session_is_not_connected() {
        let core = ClientCore::new();
        assert!(matches!(
            core.send_raw("x", None).await,
            Err(NetError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn request_is_answered_by_matching_response() {
        let (core, _link, mut rx) = connected();
        let waiter = {
            let core = core.clone();
            tokio::spawn(async move {
                core.request::<str, String>("echo", Some("hi"), Duration::from_secs(2))
                    .await
            })
        };

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.kind, PacketKind::Request);
        assert!(core.resolve(&Packet::response("echo", sent.payload.clone())));

        assert_eq!(waiter.await.unwrap().unwrap().as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn duplicate_request_sends_nothing() {
        let (core, _link, mut rx) = connected();
        let first = {
            let core = core.clone();
            tokio::spawn(async move { core.request_raw("t", None, Duration::from_secs(2)).await })
        };
        rx.recv().await.unwrap();

        let second = core.request_raw("t", None, Duration::from_secs(2)).await;
        assert!(matches!(second, Err(NetError::DuplicateRequest(_))));
        assert!(rx.try_recv().is_err());

        core.resolve(&Packet::response("t", None));
        assert_eq!(first.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn disconnect_fires_once_and_cancels_requests() {
        let (core, link, mut rx) = connected();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let owner = core.registry().owner();
        core.registry()
            .on_disconnect(owner, move |reason| {
                assert_eq!(reason, DisconnectReason::RemoteConnectionClose);
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let pending = {
            let core = core.clone();
            tokio::spawn(async move { core.request_raw("slow", None, Duration::from_secs(5)).await })
        };
        rx.recv().await.unwrap();

        core.ended(&link, DisconnectReason::RemoteConnectionClose);
        core.ended(&link, DisconnectReason::ConnectionReset);
        assert!(!core.close().await);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(matches!(pending.await.unwrap(), Err(NetError::Cancelled(_))));
    }

    #[tokio::test]
    async fn inbound_send_reaches_receive_endpoint() {
        let (core, link, _rx) = connected();
        let got = Arc::new(Mutex::new(None));
        let slot = got.clone();
        let owner = core.registry().owner();
        core.registry()
            .on_receive::<u32, _>(owner, "score", move |value| {
                *slot.lock().unwrap() = value;
            })
            .unwrap();

        let payload = core.serializer().encode(&42u32).unwrap();
        core.handle(&link, Packet::send("score", Some(payload))).await;
        assert_eq!(*got.lock().unwrap(), Some(42));
    }
}
