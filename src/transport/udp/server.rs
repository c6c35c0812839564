use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::NetworkConfig;
use crate::core::packet::Packet;
use crate::core::peer::PeerId;
use crate::error::{NetError, Result};
use crate::protocol::events::{self, NetEvent};
use crate::protocol::server::ServerCore;
use crate::transport::peers::Admission;
use crate::transport::udp::engine::{EngineEvent, EngineSettings, UdpEngine};
use crate::transport::udp::{resolve, send_frame, SessionQueue, UdpLink};
use crate::transport::{DeliveryMethod, Link};
use crate::utils::metrics::Timer;
use crate::utils::timeout::with_timeout_error;

/// Datagram server.
///
/// Derefs to [`ServerCore`]. Also acts as NAT relay: introduction requests are
/// passed to the registry's NAT relay handler, and a returned target gets both
/// sides introduced.
pub struct UdpServer {
    core: Arc<ServerCore>,
    config: NetworkConfig,
    engine: Mutex<Option<Arc<UdpEngine>>>,
}

impl UdpServer {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            core: Arc::new(ServerCore::new(config.server.max_peers)),
            config,
            engine: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn engine(&self) -> Option<Arc<UdpEngine>> {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bind `config.server.address` and start serving.
    ///
    /// Returns the bound address.
    #[instrument(skip(self), fields(address = %self.config.server.address))]
    pub async fn listen(&self) -> Result<SocketAddr> {
        let address = resolve(&self.config.server.address).await?;
        let settings = EngineSettings::server(
            &self.config.transport,
            self.config.server.max_peers,
            self.config.server.backpressure_limit,
        );
        let (engine, events) = UdpEngine::bind(address, settings, self.core.metrics().clone()).await?;
        let local = engine.local_addr()?;
        info!(%local, max_peers = self.config.server.max_peers, "Listening for datagrams");

        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let event_loop = EventLoop {
            core: self.core.clone(),
            engine: engine.clone(),
            sessions: HashMap::new(),
            closed: closed_tx,
            queue_limit: self.config.server.backpressure_limit,
        };
        tokio::spawn(event_loop.run(events, closed_rx));
        let old = self
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(engine);
        if let Some(old) = old {
            old.shutdown().await;
        }
        Ok(local)
    }

    pub fn is_listening(&self) -> bool {
        self.engine().is_some_and(|engine| engine.is_running())
    }

    /// Send raw bytes to one peer with an explicit delivery method
    pub async fn send_with_raw(
        &self,
        peer: &PeerId,
        tag: &str,
        payload: Option<Bytes>,
        method: DeliveryMethod,
    ) -> Result<()> {
        let engine = self.engine().ok_or(NetError::NotConnected)?;
        if !self.core.is_connected(peer) {
            return Err(NetError::NotConnected);
        }
        let packet = Packet::send(tag, payload);
        send_frame(&engine, peer.socket_addr(), &packet, method).await?;
        self.core.metrics().packet_sent(packet.encoded_len() as u64);
        events::record(NetEvent::Send, Some(peer), Some(&packet), None);
        Ok(())
    }

    pub async fn send_with<T: Serialize + ?Sized>(
        &self,
        peer: &PeerId,
        tag: &str,
        payload: Option<&T>,
        method: DeliveryMethod,
    ) -> Result<()> {
        let bytes = self.core.serializer().encode_optional(payload)?;
        self.send_with_raw(peer, tag, bytes, method).await
    }

    /// Broadcast with an explicit delivery method.
    ///
    /// `Ok(false)` when at least one peer could not be reached.
    pub async fn broadcast_with<T: Serialize + ?Sized>(
        &self,
        tag: &str,
        payload: Option<&T>,
        method: DeliveryMethod,
    ) -> Result<bool> {
        let engine = self.engine().ok_or(NetError::NotConnected)?;
        let bytes = self.core.serializer().encode_optional(payload)?;
        let packet = Packet::send(tag, bytes);
        packet.validate()?;

        let mut all_sent = true;
        for peer in self.core.peers() {
            match send_frame(&engine, peer.socket_addr(), &packet, method).await {
                Ok(()) => self.core.metrics().packet_sent(packet.encoded_len() as u64),
                Err(e) => {
                    warn!(%peer, error = %e, "Broadcast send failed");
                    all_sent = false;
                }
            }
        }
        events::record(NetEvent::Send, None, Some(&packet), None);
        Ok(all_sent)
    }

    /// Disconnect every peer with `LocalClose` and release the socket
    pub async fn close(&self) -> Result<usize> {
        let _timer = Timer::start("udp_server_close");
        let core = self.core.clone();
        let dropped = with_timeout_error(
            async move { Ok(core.disconnect_all().await) },
            self.config.server.shutdown_timeout,
            "shutdown",
        )
        .await?;

        let engine = self
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(engine) = engine {
            engine.shutdown().await;
        }
        info!(dropped, "Server closed");
        self.core.metrics().log_metrics();
        Ok(dropped)
    }
}

impl Deref for UdpServer {
    type Target = ServerCore;

    fn deref(&self) -> &ServerCore {
        &self.core
    }
}

/// Translates engine events for the server core.
///
/// Owns the per-peer dispatch queues. Sessions closed from this side are pruned
/// through the links' close notices, since the engine raises no event for them.
struct EventLoop {
    core: Arc<ServerCore>,
    engine: Arc<UdpEngine>,
    sessions: HashMap<SocketAddr, SessionQueue>,
    closed: mpsc::UnboundedSender<SocketAddr>,
    queue_limit: usize,
}

impl EventLoop {
    async fn run(mut self, mut events: mpsc::Receiver<EngineEvent>, mut closed: mpsc::UnboundedReceiver<SocketAddr>) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
                Some(addr) = closed.recv() => self.prune(addr),
            }
        }
        debug!("Server event loop stopped");
    }

    /// Forget a session closed locally; its disconnect was already reported
    fn prune(&mut self, addr: SocketAddr) {
        if self
            .sessions
            .get(&addr)
            .is_some_and(|session| !session.link().is_open())
        {
            self.sessions.remove(&addr);
            trace!(%addr, "Locally closed session pruned");
        }
    }

    async fn on_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Connected(addr) => {
                let link: Arc<dyn Link> = Arc::new(UdpLink::with_close_notice(
                    self.engine.clone(),
                    addr,
                    DeliveryMethod::default(),
                    self.closed.clone(),
                ));
                match self.core.admit(link.clone()) {
                    Admission::Admitted => {
                        let core = self.core.clone();
                        let peer = PeerId::from(addr);
                        let prelude = Box::pin(async move { core.announce(peer).await });
                        let session =
                            SessionQueue::spawn(link, self.core.clone(), self.queue_limit, prelude);
                        self.sessions.insert(addr, session);
                    }
                    refused => {
                        debug!(%addr, ?refused, "Dropping refused datagram session");
                        self.engine.disconnect(addr).await;
                    }
                }
            }
            EngineEvent::Receive(addr, frame) => match self.sessions.get(&addr).cloned() {
                Some(session) if session.link().is_open() => {
                    session.deliver(self.core.as_ref(), &frame).await;
                }
                Some(_) => self.prune(addr),
                None => trace!(%addr, "Datagram from unknown session dropped"),
            },
            EngineEvent::Disconnected(addr, reason) => {
                if let Some(session) = self.sessions.remove(&addr) {
                    session.end(reason).await;
                }
            }
            EngineEvent::NatIntroductionRequest {
                local,
                remote,
                token,
            } => {
                let target = self.core.registry().dispatch_nat_relay(
                    &PeerId::from(local),
                    &PeerId::from(remote),
                    &token,
                );
                if let Some(target) = target {
                    if let Err(e) = self
                        .engine
                        .introduce(
                            target.local.socket_addr(),
                            target.remote.socket_addr(),
                            local,
                            remote,
                            &token,
                        )
                        .await
                    {
                        warn!(%remote, token, error = %e, "NAT introduction failed");
                    }
                }
            }
            EngineEvent::NatIntroductionSuccess { target, .. } => {
                trace!(%target, "Unexpected punch at the relay");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    #[tokio::test]
    async fn locally_closed_sessions_are_pruned() {
        let core = Arc::new(ServerCore::new(8));
        let settings = EngineSettings::server(&TransportConfig::default(), 8, 8);
        let (engine, _events) = UdpEngine::bind(
            "127.0.0.1:0".parse().unwrap(),
            settings,
            core.metrics().clone(),
        )
        .await
        .unwrap();
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let mut event_loop = EventLoop {
            core: core.clone(),
            engine,
            sessions: HashMap::new(),
            closed: closed_tx,
            queue_limit: 8,
        };

        for port in 40_001..=40_003u16 {
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            event_loop.on_event(EngineEvent::Connected(addr)).await;
        }
        assert_eq!(event_loop.sessions.len(), 3);
        assert_eq!(core.peer_count(), 3);

        assert!(core.disconnect_peer(&PeerId::from(SocketAddr::from(([127, 0, 0, 1], 40_001)))).await);
        assert_eq!(core.disconnect_all().await, 2);
        for _ in 0..3 {
            let addr = closed_rx.recv().await.unwrap();
            event_loop.prune(addr);
        }
        assert!(event_loop.sessions.is_empty());
        assert_eq!(core.peer_count(), 0);
    }
}
