//! # Datagram Engine
//!
//! Connection-oriented sessions over one `UdpSocket`.
//!
//! Every datagram on the wire is a bincode-encoded [`Datagram`]. On top of that the
//! engine provides:
//! - a connect handshake with an optional shared key and a peer limit
//! - per-send delivery guarantees (see [`DeliveryMethod`])
//! - keep-alive pings and a silence timeout
//! - NAT introduction and hole punching
//!
//! A single task owns the socket's receive side and a periodic tick. Whatever it
//! observes is reported as [`EngineEvent`]s on a bounded channel, in the order it
//! happened.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::error::{NetError, Result};
use crate::protocol::handshake::{ConnectStatus, DisconnectReason};
use crate::transport::DeliveryMethod;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;

/// Largest datagram the socket will read
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Reliable-unordered sequence numbers remembered for duplicate suppression
const DEDUP_WINDOW: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
enum Channel {
    Unordered,
    Ordered,
}

#[derive(Debug, Serialize, Deserialize)]
enum Datagram {
    ConnectRequest { key: String, connection_id: u64 },
    ConnectAccept { connection_id: u64 },
    ConnectReject { status: ConnectStatus },
    Disconnect,
    Ping,
    Pong,
    Unreliable { payload: Vec<u8> },
    Reliable { channel: Channel, seq: u64, payload: Vec<u8> },
    Ack { channel: Channel, seq: u64 },
    NatIntroRequest { internal: SocketAddr, token: String },
    NatIntroduction { internal: SocketAddr, external: SocketAddr, token: String },
    NatPunch { token: String, reply: bool },
}

fn encode(datagram: &Datagram) -> Result<Vec<u8>> {
    Ok(bincode::serialize(datagram)?)
}

/// What the engine reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Connected(SocketAddr),
    Disconnected(SocketAddr, DisconnectReason),
    Receive(SocketAddr, Bytes),
    /// A client at `remote` (its own view: `local`) asks to be introduced to someone
    NatIntroductionRequest {
        local: SocketAddr,
        remote: SocketAddr,
        token: String,
    },
    /// A punch from `target` got through
    NatIntroductionSuccess { target: SocketAddr, token: String },
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Answer connect requests (server role)
    pub accept_incoming: bool,
    pub max_peers: usize,
    pub connection_key: String,
    pub ping_interval: Duration,
    pub disconnect_timeout: Duration,
    pub resend_interval: Duration,
    pub max_resends: u32,
    pub max_datagram_size: usize,
    pub event_queue: usize,
}

impl EngineSettings {
    pub fn client(transport: &TransportConfig, event_queue: usize) -> Self {
        Self {
            accept_incoming: false,
            max_peers: 1,
            connection_key: transport.connection_key.clone(),
            ping_interval: transport.ping_interval,
            disconnect_timeout: transport.disconnect_timeout,
            resend_interval: transport.resend_interval,
            max_resends: transport.max_resends,
            max_datagram_size: transport.max_datagram_size,
            event_queue,
        }
    }

    pub fn server(transport: &TransportConfig, max_peers: usize, event_queue: usize) -> Self {
        Self {
            accept_incoming: true,
            max_peers,
            ..Self::client(transport, event_queue)
        }
    }
}

struct Outgoing {
    datagram: Vec<u8>,
    sent_at: Instant,
    resends: u32,
}

struct PeerState {
    connection_id: u64,
    last_received: Instant,
    last_ping: Instant,
    next_unordered: u64,
    next_ordered: u64,
    unacked: HashMap<(Channel, u64), Outgoing>,
    seen: HashSet<u64>,
    seen_order: VecDeque<u64>,
    expected: u64,
    held: BTreeMap<u64, Vec<u8>>,
}

impl PeerState {
    fn new(connection_id: u64) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            last_received: now,
            last_ping: now,
            next_unordered: 0,
            next_ordered: 0,
            unacked: HashMap::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            expected: 0,
            held: BTreeMap::new(),
        }
    }

    /// Returns `false` when `seq` was already delivered
    fn remember(&mut self, seq: u64) -> bool {
        if !self.seen.insert(seq) {
            return false;
        }
        self.seen_order.push_back(seq);
        if self.seen_order.len() > DEDUP_WINDOW {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    /// Accept an ordered-channel datagram.
    ///
    /// Returns the payloads now releasable in sequence order, or `None` when `seq` is
    /// a full window or more ahead of the next expected one and was not kept.
    fn receive_ordered(&mut self, seq: u64, payload: Vec<u8>) -> Option<Vec<Vec<u8>>> {
        if seq < self.expected {
            return Some(Vec::new());
        }
        if seq - self.expected >= DEDUP_WINDOW as u64 {
            return None;
        }
        if seq > self.expected {
            self.held.entry(seq).or_insert(payload);
            return Some(Vec::new());
        }

        let mut ready = vec![payload];
        self.expected += 1;
        while let Some(next) = self.held.remove(&self.expected) {
            ready.push(next);
            self.expected += 1;
        }
        Some(ready)
    }
}

/// Datagrams and events produced while the peer table was locked
#[derive(Default)]
struct Outbox {
    datagrams: Vec<(SocketAddr, Vec<u8>)>,
    events: Vec<EngineEvent>,
}

impl Outbox {
    fn push(&mut self, addr: SocketAddr, datagram: &Datagram) {
        match encode(datagram) {
            Ok(bytes) => self.datagrams.push((addr, bytes)),
            Err(e) => warn!(%addr, error = %e, "Failed to encode engine datagram"),
        }
    }
}

enum Wake {
    Stop,
    Tick,
    Datagram(usize, SocketAddr),
    Idle,
}

pub struct UdpEngine {
    socket: UdpSocket,
    settings: EngineSettings,
    peers: Mutex<HashMap<SocketAddr, PeerState>>,
    connecting: Mutex<HashMap<SocketAddr, oneshot::Sender<ConnectStatus>>>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl UdpEngine {
    /// Bind a socket and start the engine task
    pub async fn bind(
        addr: SocketAddr,
        settings: EngineSettings,
        metrics: Arc<Metrics>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<EngineEvent>)> {
        let socket = UdpSocket::bind(addr).await?;
        let (events, rx) = mpsc::channel(settings.event_queue.max(1));
        let engine = Arc::new(Self {
            socket,
            settings,
            peers: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            metrics,
        });
        debug!(local = ?engine.socket.local_addr().ok(), "Datagram engine bound");
        tokio::spawn(engine.clone().run(events));
        Ok((engine, rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<SocketAddr, PeerState>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connecting(&self) -> MutexGuard<'_, HashMap<SocketAddr, oneshot::Sender<ConnectStatus>>> {
        self.connecting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self, peer: &SocketAddr) -> bool {
        self.peers().contains_key(peer)
    }

    pub fn connected_peers(&self) -> Vec<SocketAddr> {
        self.peers().keys().copied().collect()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Open a session with `addr`.
    ///
    /// The connect request is repeated every resend interval until the remote side
    /// answers or `timeout` elapses.
    pub async fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<ConnectStatus> {
        let (tx, mut rx) = oneshot::channel();
        self.connecting().insert(addr, tx);

        let request = encode(&Datagram::ConnectRequest {
            key: self.settings.connection_key.clone(),
            connection_id: rand::random(),
        })?;

        let attempt = async {
            let mut ticker = interval(self.settings.resend_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.socket.send_to(&request, addr).await?;
                    }
                    status = &mut rx => {
                        return status.map_err(|_| NetError::Cancelled("connect".to_string()));
                    }
                }
            }
        };

        let result = with_timeout_error(attempt, timeout, "connect").await;
        self.connecting().remove(&addr);
        result
    }

    /// Send one payload to a connected peer
    pub async fn send(&self, peer: SocketAddr, payload: &[u8], method: DeliveryMethod) -> Result<()> {
        let datagram = {
            let mut peers = self.peers();
            let state = peers.get_mut(&peer).ok_or(NetError::NotConnected)?;

            let (datagram, key) = match method {
                DeliveryMethod::Unreliable => (
                    Datagram::Unreliable {
                        payload: payload.to_vec(),
                    },
                    None,
                ),
                DeliveryMethod::ReliableUnordered => {
                    let seq = state.next_unordered;
                    (
                        Datagram::Reliable {
                            channel: Channel::Unordered,
                            seq,
                            payload: payload.to_vec(),
                        },
                        Some((Channel::Unordered, seq)),
                    )
                }
                DeliveryMethod::ReliableOrdered => {
                    let seq = state.next_ordered;
                    (
                        Datagram::Reliable {
                            channel: Channel::Ordered,
                            seq,
                            payload: payload.to_vec(),
                        },
                        Some((Channel::Ordered, seq)),
                    )
                }
            };

            let bytes = encode(&datagram)?;
            // Checked before the sequence number is consumed, a gap would stall the ordered channel
            if bytes.len() > self.settings.max_datagram_size {
                return Err(NetError::OversizedPacket(bytes.len()));
            }

            if let Some(key) = key {
                match key.0 {
                    Channel::Unordered => state.next_unordered += 1,
                    Channel::Ordered => state.next_ordered += 1,
                }
                state.unacked.insert(
                    key,
                    Outgoing {
                        datagram: bytes.clone(),
                        sent_at: Instant::now(),
                        resends: 0,
                    },
                );
            }
            bytes
        };

        self.socket.send_to(&datagram, peer).await?;
        Ok(())
    }

    /// Drop a session from this side. No event is raised.
    pub async fn disconnect(&self, peer: SocketAddr) -> bool {
        let removed = self.peers().remove(&peer).is_some();
        if removed {
            self.send_unconnected(peer, &Datagram::Disconnect).await;
        }
        removed
    }

    /// Disconnect every peer and stop the engine task
    pub async fn shutdown(&self) {
        let peers: Vec<SocketAddr> = self.peers().drain().map(|(addr, _)| addr).collect();
        for peer in peers {
            self.send_unconnected(peer, &Datagram::Disconnect).await;
        }
        self.cancel.cancel();
    }

    /// Ask the relay at `server` to introduce this endpoint to the holder of `token`
    pub async fn request_nat_introduction(&self, server: SocketAddr, token: &str) -> Result<()> {
        let datagram = Datagram::NatIntroRequest {
            internal: self.local_addr()?,
            token: token.to_string(),
        };
        self.socket.send_to(&encode(&datagram)?, server).await?;
        Ok(())
    }

    /// Tell two parties about each other so they can punch through
    pub async fn introduce(
        &self,
        host_internal: SocketAddr,
        host_external: SocketAddr,
        client_internal: SocketAddr,
        client_external: SocketAddr,
        token: &str,
    ) -> Result<()> {
        let to_host = Datagram::NatIntroduction {
            internal: client_internal,
            external: client_external,
            token: token.to_string(),
        };
        let to_client = Datagram::NatIntroduction {
            internal: host_internal,
            external: host_external,
            token: token.to_string(),
        };
        self.socket.send_to(&encode(&to_host)?, host_external).await?;
        self.socket.send_to(&encode(&to_client)?, client_external).await?;
        debug!(%host_external, %client_external, token, "Sent NAT introductions");
        Ok(())
    }

    async fn send_unconnected(&self, addr: SocketAddr, datagram: &Datagram) {
        match encode(datagram) {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, addr).await {
                    trace!(%addr, error = %e, "Best-effort datagram not sent");
                }
            }
            Err(e) => warn!(%addr, error = %e, "Failed to encode engine datagram"),
        }
    }

    // Owns the only event sender, so the receiver closes once this returns
    async fn run(self: Arc<Self>, events: mpsc::Sender<EngineEvent>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut ticker = interval(self.settings.resend_interval.min(self.settings.ping_interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Stop,
                _ = ticker.tick() => Wake::Tick,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => Wake::Datagram(n, from),
                    Err(e) => {
                        // ICMP unreachable surfaces here on some platforms; the socket is fine
                        trace!(error = %e, "Receive failed");
                        Wake::Idle
                    }
                },
            };

            let outbox = match wake {
                Wake::Stop => break,
                Wake::Tick => self.on_tick(),
                Wake::Datagram(n, from) => self.on_datagram(&buf[..n], from),
                Wake::Idle => continue,
            };

            if !self.flush(outbox, &events).await {
                break;
            }
        }
        debug!("Datagram engine stopped");
    }

    /// Returns `false` once nobody listens for events
    async fn flush(&self, outbox: Outbox, events: &mpsc::Sender<EngineEvent>) -> bool {
        for (addr, bytes) in outbox.datagrams {
            if let Err(e) = self.socket.send_to(&bytes, addr).await {
                trace!(%addr, error = %e, "Send failed");
            }
        }
        for event in outbox.events {
            if events.send(event).await.is_err() {
                return false;
            }
        }
        true
    }

    fn on_datagram(&self, data: &[u8], from: SocketAddr) -> Outbox {
        let mut out = Outbox::default();
        let datagram: Datagram = match bincode::deserialize(data) {
            Ok(datagram) => datagram,
            Err(e) => {
                self.metrics.protocol_error();
                trace!(%from, error = %e, "Undecodable datagram dropped");
                return out;
            }
        };

        match datagram {
            Datagram::ConnectRequest { key, connection_id } => {
                self.on_connect_request(from, &key, connection_id, &mut out)
            }
            Datagram::ConnectAccept { connection_id } => {
                if let Some(waiter) = self.connecting().remove(&from) {
                    self.peers()
                        .entry(from)
                        .or_insert_with(|| PeerState::new(connection_id));
                    out.events.push(EngineEvent::Connected(from));
                    let _ = waiter.send(ConnectStatus::Ok);
                }
            }
            Datagram::ConnectReject { status } => {
                if let Some(waiter) = self.connecting().remove(&from) {
                    let _ = waiter.send(status);
                }
            }
            Datagram::NatIntroRequest { internal, token } => {
                out.events.push(EngineEvent::NatIntroductionRequest {
                    local: internal,
                    remote: from,
                    token,
                });
            }
            Datagram::NatIntroduction {
                internal,
                external,
                token,
            } => {
                let punch = Datagram::NatPunch {
                    token,
                    reply: false,
                };
                out.push(internal, &punch);
                if external != internal {
                    out.push(external, &punch);
                }
            }
            Datagram::NatPunch { token, reply } => {
                if !reply {
                    out.push(
                        from,
                        &Datagram::NatPunch {
                            token: token.clone(),
                            reply: true,
                        },
                    );
                }
                out.events
                    .push(EngineEvent::NatIntroductionSuccess { target: from, token });
            }
            other => self.on_session_datagram(from, other, &mut out),
        }
        out
    }

    fn on_connect_request(&self, from: SocketAddr, key: &str, connection_id: u64, out: &mut Outbox) {
        if !self.settings.accept_incoming {
            out.push(
                from,
                &Datagram::ConnectReject {
                    status: ConnectStatus::NotListening,
                },
            );
            return;
        }

        let mut peers = self.peers();
        if let Some(existing) = peers.get(&from) {
            if existing.connection_id == connection_id {
                // Our accept was lost; answer again
                out.push(from, &Datagram::ConnectAccept { connection_id });
                return;
            }
            // Same address, new connection: the old session is gone
            peers.remove(&from);
            out.events
                .push(EngineEvent::Disconnected(from, DisconnectReason::RemoteConnectionClose));
        }

        let status = if key != self.settings.connection_key {
            ConnectStatus::Error
        } else if peers.len() >= self.settings.max_peers {
            ConnectStatus::Full
        } else {
            ConnectStatus::Ok
        };

        if status != ConnectStatus::Ok {
            info!(%from, ?status, "Connect request rejected");
            self.metrics.connection_rejected();
            out.push(from, &Datagram::ConnectReject { status });
            return;
        }

        peers.insert(from, PeerState::new(connection_id));
        out.push(from, &Datagram::ConnectAccept { connection_id });
        out.events.push(EngineEvent::Connected(from));
    }

    fn on_session_datagram(&self, from: SocketAddr, datagram: Datagram, out: &mut Outbox) {
        let mut peers = self.peers();
        let Some(peer) = peers.get_mut(&from) else {
            trace!(%from, "Datagram from unknown peer dropped");
            return;
        };
        peer.last_received = Instant::now();

        match datagram {
            Datagram::Disconnect => {
                peers.remove(&from);
                out.events
                    .push(EngineEvent::Disconnected(from, DisconnectReason::RemoteConnectionClose));
            }
            Datagram::Ping => out.push(from, &Datagram::Pong),
            Datagram::Pong => {}
            Datagram::Unreliable { payload } => {
                out.events.push(EngineEvent::Receive(from, Bytes::from(payload)));
            }
            Datagram::Reliable {
                channel,
                seq,
                payload,
            } => match channel {
                Channel::Unordered => {
                    out.push(from, &Datagram::Ack { channel, seq });
                    if peer.remember(seq) {
                        out.events.push(EngineEvent::Receive(from, Bytes::from(payload)));
                    }
                }
                Channel::Ordered => match peer.receive_ordered(seq, payload) {
                    Some(ready) => {
                        out.push(from, &Datagram::Ack { channel, seq });
                        for payload in ready {
                            out.events.push(EngineEvent::Receive(from, Bytes::from(payload)));
                        }
                    }
                    // Left unacknowledged so the sender retries once the window moves
                    None => trace!(%from, seq, expected = peer.expected, "Ordered datagram too far ahead"),
                },
            },
            Datagram::Ack { channel, seq } => {
                peer.unacked.remove(&(channel, seq));
            }
            // Handshake and NAT datagrams are handled before the session lookup
            _ => {}
        }
    }

    fn on_tick(&self) -> Outbox {
        let now = Instant::now();
        let mut out = Outbox::default();
        let mut peers = self.peers();
        let mut dead = Vec::new();

        for (addr, peer) in peers.iter_mut() {
            if now.duration_since(peer.last_received) > self.settings.disconnect_timeout {
                dead.push(*addr);
                continue;
            }

            let mut exhausted = false;
            for outgoing in peer.unacked.values_mut() {
                if now.duration_since(outgoing.sent_at) < self.settings.resend_interval {
                    continue;
                }
                if outgoing.resends >= self.settings.max_resends {
                    exhausted = true;
                    break;
                }
                outgoing.resends += 1;
                outgoing.sent_at = now;
                out.datagrams.push((*addr, outgoing.datagram.clone()));
                self.metrics.datagram_resent();
            }
            if exhausted {
                dead.push(*addr);
                continue;
            }

            if now.duration_since(peer.last_ping) >= self.settings.ping_interval {
                peer.last_ping = now;
                out.push(*addr, &Datagram::Ping);
            }
        }

        for addr in dead {
            peers.remove(&addr);
            debug!(%addr, "Peer timed out");
            out.push(addr, &Datagram::Disconnect);
            out.events
                .push(EngineEvent::Disconnected(addr, DisconnectReason::Timeout));
        }
        out
    }
}
