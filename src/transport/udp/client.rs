use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::NetworkConfig;
use crate::core::packet::Packet;
use crate::core::peer::PeerId;
use crate::error::{NetError, Result};
use crate::protocol::client::ClientCore;
use crate::protocol::events::{self, NetEvent};
use crate::protocol::handshake::{ConnectStatus, ConnectionState};
use crate::transport::udp::engine::{EngineEvent, EngineSettings, UdpEngine};
use crate::transport::udp::{bind_address_for, resolve, SessionQueue, UdpLink};
use crate::transport::{DeliveryMethod, Link};
use crate::utils::timeout::with_timeout_error;

/// The live session: its link and dispatch queue
struct Session {
    link: Arc<UdpLink>,
    queue: SessionQueue,
}

/// State shared with the engine event task
#[derive(Default)]
struct Shared {
    session: Mutex<Option<Session>>,
    attached: Mutex<Option<oneshot::Sender<()>>>,
    nat_waiters: Mutex<HashMap<String, oneshot::Sender<SocketAddr>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Datagram client.
///
/// Derefs to [`ClientCore`]; plain `send` and `request` use `ReliableOrdered`
/// delivery, [`UdpClient::send_with`] picks another method per send.
pub struct UdpClient {
    core: Arc<ClientCore>,
    config: NetworkConfig,
    engine: Mutex<Option<Arc<UdpEngine>>>,
    shared: Arc<Shared>,
}

impl UdpClient {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            core: Arc::new(ClientCore::with_request_timeout(config.client.request_timeout)),
            config,
            engine: Mutex::new(None),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Local address of the client socket, once one is bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.engine).as_ref()?.local_addr().ok()
    }

    /// Connect to `config.client.address`.
    ///
    /// Rejections map the same way as for the stream client: `Full` stays `Full`,
    /// `NotListening` and `Error` become `Failed`.
    #[instrument(skip(self), fields(address = %self.config.client.address))]
    pub async fn connect(&self, timeout: Duration) -> ConnectionState {
        if self.core.is_connected() {
            return ConnectionState::Connected;
        }
        self.core.set_state(ConnectionState::Connecting);

        let state = match self.try_connect(timeout).await {
            Ok(ConnectStatus::Ok) => ConnectionState::Connected,
            Ok(status) => {
                info!(?status, "Server refused connection");
                ConnectionState::from(status)
            }
            Err(NetError::Timeout(_)) => ConnectionState::TimedOut,
            Err(e) => {
                self.core.metrics().connection_error();
                warn!(error = %e, "Connect failed");
                ConnectionState::Failed
            }
        };

        if state != ConnectionState::Connected {
            lock(&self.shared.attached).take();
            self.core.set_state(state);
        }
        state
    }

    pub async fn connect_default(&self) -> ConnectionState {
        self.connect(self.config.client.connection_timeout).await
    }

    async fn try_connect(&self, timeout: Duration) -> Result<ConnectStatus> {
        let server = resolve(&self.config.client.address).await?;
        let engine = self.ensure_engine(&server).await?;

        let (tx, rx) = oneshot::channel();
        *lock(&self.shared.attached) = Some(tx);

        let attempt = async {
            let status = engine.connect(server, timeout).await?;
            if status == ConnectStatus::Ok {
                // The event task attaches the link before anything from the server
                // is dispatched
                rx.await
                    .map_err(|_| NetError::Cancelled("connect".to_string()))?;
            }
            Ok(status)
        };
        with_timeout_error(attempt, timeout, "connect").await
    }

    /// The running engine, binding a fresh socket if there is none
    async fn ensure_engine(&self, remote: &SocketAddr) -> Result<Arc<UdpEngine>> {
        let current = lock(&self.engine).clone();
        if let Some(engine) = current.filter(|engine| engine.is_running()) {
            return Ok(engine);
        }

        let settings = EngineSettings::client(
            &self.config.transport,
            self.config.client.backpressure_limit,
        );
        let (engine, events) =
            UdpEngine::bind(bind_address_for(remote), settings, self.core.metrics().clone()).await?;
        debug!(local = ?engine.local_addr().ok(), "Client socket bound");

        tokio::spawn(event_loop(
            self.core.clone(),
            self.shared.clone(),
            engine.clone(),
            events,
            self.config.client.backpressure_limit,
        ));

        let old = lock(&self.engine).replace(engine.clone());
        if let Some(old) = old {
            old.shutdown().await;
        }
        Ok(engine)
    }

    /// Send raw bytes with an explicit delivery method
    pub async fn send_with_raw(
        &self,
        tag: &str,
        payload: Option<Bytes>,
        method: DeliveryMethod,
    ) -> Result<()> {
        let link = lock(&self.shared.session)
            .as_ref()
            .map(|session| session.link.clone())
            .ok_or(NetError::NotConnected)?;
        if !self.core.is_connected() {
            return Err(NetError::NotConnected);
        }
        let packet = Packet::send(tag, payload);
        let len = packet.encoded_len() as u64;
        link.send_with(packet.clone(), method).await?;
        self.core.metrics().packet_sent(len);
        events::record(NetEvent::Send, Some(&link.peer_id()), Some(&packet), None);
        Ok(())
    }

    /// Send an encoded value with an explicit delivery method
    pub async fn send_with<T: Serialize + ?Sized>(
        &self,
        tag: &str,
        payload: Option<&T>,
        method: DeliveryMethod,
    ) -> Result<()> {
        let bytes = self.core.serializer().encode_optional(payload)?;
        self.send_with_raw(tag, bytes, method).await
    }

    /// Ask the relay at `server` for an introduction to whoever registered the same
    /// `token`, then wait for the first punch to get through.
    ///
    /// Best effort: returns [`NetError::Timeout`] when no punch arrives in time.
    pub async fn nat_introduction(
        &self,
        server: SocketAddr,
        token: &str,
        timeout: Duration,
    ) -> Result<PeerId> {
        let engine = self.ensure_engine(&server).await?;
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.nat_waiters).insert(token.to_string(), tx);

        let result = async {
            engine.request_nat_introduction(server, token).await?;
            with_timeout_error(
                async {
                    rx.await
                        .map_err(|_| NetError::Cancelled(token.to_string()))
                },
                timeout,
                "nat-introduction",
            )
            .await
        }
        .await;

        lock(&self.shared.nat_waiters).remove(token);
        let target = result?;
        info!(%target, token, "NAT punch-through succeeded");
        Ok(PeerId::from(target))
    }

    /// Close the session and release the socket.
    ///
    /// Returns `true` when a live session was closed.
    pub async fn close(&self) -> bool {
        let closed = self.core.close().await;
        let engine = lock(&self.engine).take();
        if let Some(engine) = engine {
            engine.shutdown().await;
        }
        closed
    }
}

impl Deref for UdpClient {
    type Target = ClientCore;

    fn deref(&self) -> &ClientCore {
        &self.core
    }
}

async fn event_loop(
    core: Arc<ClientCore>,
    shared: Arc<Shared>,
    engine: Arc<UdpEngine>,
    mut events: mpsc::Receiver<EngineEvent>,
    queue_limit: usize,
) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Connected(addr) => {
                let link = Arc::new(UdpLink::new(engine.clone(), addr, DeliveryMethod::default()));
                let queue = SessionQueue::spawn(
                    link.clone(),
                    core.clone(),
                    queue_limit,
                    Box::pin(async {}),
                );
                *lock(&shared.session) = Some(Session {
                    link: link.clone(),
                    queue,
                });
                core.attach(link);
                if let Some(attached) = lock(&shared.attached).take() {
                    let _ = attached.send(());
                }
            }
            EngineEvent::Receive(addr, frame) => match current_queue(&shared, addr) {
                Some(queue) => queue.deliver(core.as_ref(), &frame).await,
                None => trace!(%addr, "Datagram for a stale session dropped"),
            },
            EngineEvent::Disconnected(addr, reason) => {
                let session = {
                    let mut slot = lock(&shared.session);
                    match slot.as_ref() {
                        Some(session) if session.link.peer_id().socket_addr() == addr => slot.take(),
                        _ => None,
                    }
                };
                if let Some(session) = session {
                    session.link.mark_closed();
                    session.queue.end(reason).await;
                }
            }
            EngineEvent::NatIntroductionSuccess { target, token } => {
                if let Some(waiter) = lock(&shared.nat_waiters).remove(&token) {
                    let _ = waiter.send(target);
                }
            }
            EngineEvent::NatIntroductionRequest { remote, .. } => {
                trace!(%remote, "Ignoring introduction request, not a relay");
            }
        }
    }
    debug!("Client event loop stopped");
}

fn current_queue(shared: &Shared, addr: SocketAddr) -> Option<SessionQueue> {
    lock(&shared.session)
        .as_ref()
        .filter(|session| session.link.peer_id().socket_addr() == addr)
        .map(|session| session.queue.clone())
}
