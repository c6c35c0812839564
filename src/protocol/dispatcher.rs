//! # Endpoint Registry
//!
//! Routes decoded packets to application handlers by tag.
//!
//! There is one registry per role. The kinds of handler each role accepts, and the
//! arguments it passes, are fixed by the registration methods:
//!
//! | role   | kind       | handler signature                                   |
//! |--------|------------|-----------------------------------------------------|
//! | client | receive    | `Fn(Option<T>)`                                     |
//! | client | disconnect | `Fn(DisconnectReason)`                              |
//! | server | receive    | `Fn(&PeerId, Option<T>)`                            |
//! | server | response   | `Fn(&PeerId, Option<T>) -> Option<R>`               |
//! | server | connect    | `Fn(&PeerId)`                                       |
//! | server | disconnect | `Fn(&PeerId, DisconnectReason)`                     |
//! | server | nat relay  | `Fn(&PeerId, &PeerId, &str) -> Option<NatRelayTarget>` |
//!
//! Receive and response endpoints are keyed by tag and must be unique per registry;
//! at most one NAT relay handler exists. Connect and disconnect handlers fan out.
//! Handlers are invoked outside the registry lock and a panicking handler is
//! reported, never propagated into the session.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::core::packet::{Packet, MAX_TAG_LEN};
use crate::core::peer::PeerId;
use crate::core::serialization::Serializer;
use crate::error::{constants, NetError, Result};
use crate::protocol::events::{self, NetEvent};
use crate::protocol::handshake::DisconnectReason;
use crate::utils::metrics::Metrics;

/// Identifies the owner of a group of endpoints for bulk removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Receive,
    Response,
    Connect,
    Disconnect,
    NatRelay,
}

/// Endpoints the relay should introduce the requester to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatRelayTarget {
    /// The other party's address inside its own network
    pub local: PeerId,
    /// The other party's address as seen by the relay
    pub remote: PeerId,
}

type ClientReceiveFn = dyn Fn(Option<&Bytes>) -> Result<()> + Send + Sync;
type ClientDisconnectFn = dyn Fn(DisconnectReason) + Send + Sync;
type ServerReceiveFn = dyn Fn(&PeerId, Option<&Bytes>) -> Result<()> + Send + Sync;
type ServerResponseFn = dyn Fn(&PeerId, Option<&Bytes>) -> Result<Option<Bytes>> + Send + Sync;
type ServerConnectFn = dyn Fn(&PeerId) + Send + Sync;
type ServerDisconnectFn = dyn Fn(&PeerId, DisconnectReason) + Send + Sync;
type NatRelayFn = dyn Fn(&PeerId, &PeerId, &str) -> Option<NatRelayTarget> + Send + Sync;

struct Slot<F: ?Sized> {
    owner: OwnerHandle,
    handler: Arc<F>,
}

/// Tag-keyed endpoints of one kind
struct Tagged<F: ?Sized> {
    kind: EndpointKind,
    slots: HashMap<String, Slot<F>>,
}

impl<F: ?Sized> Tagged<F> {
    fn new(kind: EndpointKind) -> Self {
        Self {
            kind,
            slots: HashMap::new(),
        }
    }

    fn insert(&mut self, owner: OwnerHandle, tag: &str, handler: Arc<F>) -> Result<()> {
        validate_tag(tag)?;
        if self.slots.contains_key(tag) {
            return Err(NetError::Dispatch(format!(
                "{:?} endpoint for tag '{tag}' is already registered",
                self.kind
            )));
        }
        self.slots.insert(tag.to_string(), Slot { owner, handler });
        Ok(())
    }

    fn get(&self, tag: &str) -> Option<Arc<F>> {
        self.slots.get(tag).map(|slot| slot.handler.clone())
    }

    fn remove_owner(&mut self, owner: OwnerHandle) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.owner != owner);
        before - self.slots.len()
    }
}

/// Fan-out endpoints of one kind
struct FanOut<F: ?Sized> {
    slots: Vec<Slot<F>>,
}

impl<F: ?Sized> FanOut<F> {
    fn new() -> Self {
        Self { slots: Vec::new() }
    }

    fn push(&mut self, owner: OwnerHandle, handler: Arc<F>) {
        self.slots.push(Slot { owner, handler });
    }

    fn handlers(&self) -> Vec<Arc<F>> {
        self.slots.iter().map(|slot| slot.handler.clone()).collect()
    }

    fn remove_owner(&mut self, owner: OwnerHandle) -> usize {
        let before = self.slots.len();
        self.slots.retain(|slot| slot.owner != owner);
        before - self.slots.len()
    }
}

fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(NetError::Dispatch(constants::ERR_EMPTY_TAG.to_string()));
    }
    if tag.len() > MAX_TAG_LEN {
        return Err(NetError::Dispatch(format!(
            "Endpoint tag is {} bytes long (maximum {MAX_TAG_LEN})",
            tag.len()
        )));
    }
    Ok(())
}

/// Run a handler, turning a panic into a dispatch error
fn guarded<R>(tag: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(NetError::Dispatch(format!(
                "Handler for '{tag}' panicked: {message}"
            )))
        }
    }
}

/// Run a registry dispatch on tokio's blocking pool.
///
/// Handlers are plain closures that may block; keeping them off the async workers
/// means one slow handler cannot hold up other sessions. `None` only when the
/// blocking task could not complete, e.g. during runtime shutdown.
pub(crate) async fn offload<R, F>(call: F) -> Option<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(result) => Some(result),
        Err(e) => {
            warn!(error = %e, "Handler task did not complete");
            None
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| NetError::Dispatch(constants::ERR_REGISTRY_READ_LOCK.to_string()))
}

fn write_lock<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| NetError::Dispatch(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))
}

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

fn next_owner() -> OwnerHandle {
    OwnerHandle(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
}

// ============================================================================
// CLIENT REGISTRY
// ============================================================================

struct ClientEndpoints {
    receive: Tagged<ClientReceiveFn>,
    disconnect: FanOut<ClientDisconnectFn>,
}

/// Endpoints for the client role
pub struct ClientRegistry {
    endpoints: RwLock<ClientEndpoints>,
    serializer: Serializer,
    metrics: Arc<Metrics>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(Serializer::default(), Arc::new(Metrics::new()))
    }
}

impl ClientRegistry {
    pub fn new(serializer: Serializer, metrics: Arc<Metrics>) -> Self {
        Self {
            endpoints: RwLock::new(ClientEndpoints {
                receive: Tagged::new(EndpointKind::Receive),
                disconnect: FanOut::new(),
            }),
            serializer,
            metrics,
        }
    }

    /// Allocate a new owner handle
    pub fn owner(&self) -> OwnerHandle {
        next_owner()
    }

    /// Register a receive endpoint that gets the raw payload bytes
    pub fn on_receive_raw<F>(&self, owner: OwnerHandle, tag: &str, handler: F) -> Result<()>
    where
        F: Fn(Option<&Bytes>) + Send + Sync + 'static,
    {
        let erased: Arc<ClientReceiveFn> = Arc::new(move |payload| {
            handler(payload);
            Ok(())
        });
        write_lock(&self.endpoints)?.receive.insert(owner, tag, erased)
    }

    /// Register a receive endpoint whose payload is decoded as `T`
    pub fn on_receive<T, F>(&self, owner: OwnerHandle, tag: &str, handler: F) -> Result<()>
    where
        T: DeserializeOwned + 'static,
        F: Fn(Option<T>) + Send + Sync + 'static,
    {
        let serializer = self.serializer.clone();
        let erased: Arc<ClientReceiveFn> = Arc::new(move |payload| {
            let value = serializer.decode_optional::<T>(payload)?;
            handler(value);
            Ok(())
        });
        write_lock(&self.endpoints)?.receive.insert(owner, tag, erased)
    }

    /// Register a handler for the end of the session
    pub fn on_disconnect<F>(&self, owner: OwnerHandle, handler: F) -> Result<()>
    where
        F: Fn(DisconnectReason) + Send + Sync + 'static,
    {
        write_lock(&self.endpoints)?
            .disconnect
            .push(owner, Arc::new(handler));
        Ok(())
    }

    /// Remove every endpoint registered by `owner`
    pub fn remove_owner(&self, owner: OwnerHandle) -> Result<usize> {
        let mut endpoints = write_lock(&self.endpoints)?;
        Ok(endpoints.receive.remove_owner(owner) + endpoints.disconnect.remove_owner(owner))
    }

    pub fn has_receive(&self, tag: &str) -> bool {
        read_lock(&self.endpoints)
            .map(|e| e.receive.slots.contains_key(tag))
            .unwrap_or(false)
    }

    /// Deliver a `Send` packet; unknown tags are logged and ignored.
    pub fn dispatch_send(&self, packet: &Packet) {
        let handler = match read_lock(&self.endpoints) {
            Ok(endpoints) => endpoints.receive.get(&packet.tag),
            Err(e) => {
                self.report(packet, &e);
                return;
            }
        };

        match handler {
            Some(handler) => {
                if let Err(e) = guarded(&packet.tag, || handler(packet.payload.as_ref())) {
                    self.report(packet, &e);
                }
            }
            None => events::record(NetEvent::UnknownEndpoint, None, Some(packet), None),
        }
    }

    /// Notify every disconnect handler
    pub fn dispatch_disconnect(&self, reason: DisconnectReason) {
        let handlers = match read_lock(&self.endpoints) {
            Ok(endpoints) => endpoints.disconnect.handlers(),
            Err(_) => return,
        };
        for handler in handlers {
            let result = guarded("disconnect", || {
                handler(reason);
                Ok(())
            });
            if let Err(e) = result {
                self.metrics.dispatch_error();
                events::record(NetEvent::HandlerFailure, None, None, Some(&e));
            }
        }
    }

    fn report(&self, packet: &Packet, error: &NetError) {
        self.metrics.dispatch_error();
        events::record(NetEvent::HandlerFailure, None, Some(packet), Some(error));
    }
}

// ============================================================================
// SERVER REGISTRY
// ============================================================================

struct ServerEndpoints {
    receive: Tagged<ServerReceiveFn>,
    response: Tagged<ServerResponseFn>,
    connect: FanOut<ServerConnectFn>,
    disconnect: FanOut<ServerDisconnectFn>,
    nat_relay: Option<Slot<NatRelayFn>>,
}

/// Endpoints for the server role
pub struct ServerRegistry {
    endpoints: RwLock<ServerEndpoints>,
    serializer: Serializer,
    metrics: Arc<Metrics>,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new(Serializer::default(), Arc::new(Metrics::new()))
    }
}

impl ServerRegistry {
    pub fn new(serializer: Serializer, metrics: Arc<Metrics>) -> Self {
        Self {
            endpoints: RwLock::new(ServerEndpoints {
                receive: Tagged::new(EndpointKind::Receive),
                response: Tagged::new(EndpointKind::Response),
                connect: FanOut::new(),
                disconnect: FanOut::new(),
                nat_relay: None,
            }),
            serializer,
            metrics,
        }
    }

    /// Allocate a new owner handle
    pub fn owner(&self) -> OwnerHandle {
        next_owner()
    }

    pub fn on_receive_raw<F>(&self, owner: OwnerHandle, tag: &str, handler: F) -> Result<()>
    where
        F: Fn(&PeerId, Option<&Bytes>) + Send + Sync + 'static,
    {
        let erased: Arc<ServerReceiveFn> = Arc::new(move |peer, payload| {
            handler(peer, payload);
            Ok(())
        });
        write_lock(&self.endpoints)?.receive.insert(owner, tag, erased)
    }

    pub fn on_receive<T, F>(&self, owner: OwnerHandle, tag: &str, handler: F) -> Result<()>
    where
        T: DeserializeOwned + 'static,
        F: Fn(&PeerId, Option<T>) + Send + Sync + 'static,
    {
        let serializer = self.serializer.clone();
        let erased: Arc<ServerReceiveFn> = Arc::new(move |peer, payload| {
            let value = serializer.decode_optional::<T>(payload)?;
            handler(peer, value);
            Ok(())
        });
        write_lock(&self.endpoints)?.receive.insert(owner, tag, erased)
    }

    /// Register a response endpoint working on raw payload bytes
    pub fn on_request_raw<F>(&self, owner: OwnerHandle, tag: &str, handler: F) -> Result<()>
    where
        F: Fn(&PeerId, Option<&Bytes>) -> Option<Bytes> + Send + Sync + 'static,
    {
        let erased: Arc<ServerResponseFn> = Arc::new(move |peer, payload| Ok(handler(peer, payload)));
        write_lock(&self.endpoints)?.response.insert(owner, tag, erased)
    }

    /// Register a response endpoint: decodes the request as `T`, encodes the reply `R`
    pub fn on_request<T, R, F>(&self, owner: OwnerHandle, tag: &str, handler: F) -> Result<()>
    where
        T: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&PeerId, Option<T>) -> Option<R> + Send + Sync + 'static,
    {
        let serializer = self.serializer.clone();
        let erased: Arc<ServerResponseFn> = Arc::new(move |peer, payload| {
            let value = serializer.decode_optional::<T>(payload)?;
            let reply = handler(peer, value);
            serializer.encode_optional(reply.as_ref())
        });
        write_lock(&self.endpoints)?.response.insert(owner, tag, erased)
    }

    pub fn on_connect<F>(&self, owner: OwnerHandle, handler: F) -> Result<()>
    where
        F: Fn(&PeerId) + Send + Sync + 'static,
    {
        write_lock(&self.endpoints)?
            .connect
            .push(owner, Arc::new(handler));
        Ok(())
    }

    pub fn on_disconnect<F>(&self, owner: OwnerHandle, handler: F) -> Result<()>
    where
        F: Fn(&PeerId, DisconnectReason) + Send + Sync + 'static,
    {
        write_lock(&self.endpoints)?
            .disconnect
            .push(owner, Arc::new(handler));
        Ok(())
    }

    /// Register the single NAT relay handler
    pub fn on_nat_relay<F>(&self, owner: OwnerHandle, handler: F) -> Result<()>
    where
        F: Fn(&PeerId, &PeerId, &str) -> Option<NatRelayTarget> + Send + Sync + 'static,
    {
        let mut endpoints = write_lock(&self.endpoints)?;
        if endpoints.nat_relay.is_some() {
            return Err(NetError::Dispatch(constants::ERR_NAT_RELAY_TAKEN.to_string()));
        }
        endpoints.nat_relay = Some(Slot {
            owner,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Remove every endpoint registered by `owner`
    pub fn remove_owner(&self, owner: OwnerHandle) -> Result<usize> {
        let mut endpoints = write_lock(&self.endpoints)?;
        let mut removed = endpoints.receive.remove_owner(owner)
            + endpoints.response.remove_owner(owner)
            + endpoints.connect.remove_owner(owner)
            + endpoints.disconnect.remove_owner(owner);
        if endpoints
            .nat_relay
            .as_ref()
            .is_some_and(|slot| slot.owner == owner)
        {
            endpoints.nat_relay = None;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn has_receive(&self, tag: &str) -> bool {
        read_lock(&self.endpoints)
            .map(|e| e.receive.slots.contains_key(tag))
            .unwrap_or(false)
    }

    pub fn has_response(&self, tag: &str) -> bool {
        read_lock(&self.endpoints)
            .map(|e| e.response.slots.contains_key(tag))
            .unwrap_or(false)
    }

    /// Deliver a `Send` packet; unknown tags are logged and ignored.
    pub fn dispatch_send(&self, peer: &PeerId, packet: &Packet) {
        let handler = match read_lock(&self.endpoints) {
            Ok(endpoints) => endpoints.receive.get(&packet.tag),
            Err(e) => {
                self.report(peer, Some(packet), &e);
                return;
            }
        };

        match handler {
            Some(handler) => {
                if let Err(e) = guarded(&packet.tag, || handler(peer, packet.payload.as_ref())) {
                    self.report(peer, Some(packet), &e);
                }
            }
            None => events::record(NetEvent::UnknownEndpoint, Some(peer), Some(packet), None),
        }
    }

    /// Run the response endpoint for a `Request` packet.
    ///
    /// Returns the reply payload; `None` when the tag is unknown, the handler
    /// produced nothing, or the handler failed. The caller answers in every case.
    pub fn dispatch_request(&self, peer: &PeerId, packet: &Packet) -> Option<Bytes> {
        let handler = match read_lock(&self.endpoints) {
            Ok(endpoints) => endpoints.response.get(&packet.tag),
            Err(e) => {
                self.report(peer, Some(packet), &e);
                return None;
            }
        };

        let Some(handler) = handler else {
            events::record(NetEvent::UnknownEndpoint, Some(peer), Some(packet), None);
            return None;
        };

        match guarded(&packet.tag, || handler(peer, packet.payload.as_ref())) {
            Ok(reply) => reply,
            Err(e) => {
                self.report(peer, Some(packet), &e);
                None
            }
        }
    }

    pub fn dispatch_connect(&self, peer: &PeerId) {
        let handlers = match read_lock(&self.endpoints) {
            Ok(endpoints) => endpoints.connect.handlers(),
            Err(_) => return,
        };
        for handler in handlers {
            let result = guarded("connect", || {
                handler(peer);
                Ok(())
            });
            if let Err(e) = result {
                self.report(peer, None, &e);
            }
        }
    }

    pub fn dispatch_disconnect(&self, peer: &PeerId, reason: DisconnectReason) {
        let handlers = match read_lock(&self.endpoints) {
            Ok(endpoints) => endpoints.disconnect.handlers(),
            Err(_) => return,
        };
        for handler in handlers {
            let result = guarded("disconnect", || {
                handler(peer, reason);
                Ok(())
            });
            if let Err(e) = result {
                self.report(peer, None, &e);
            }
        }
    }

    /// Ask the application whether, and to whom, `remote` should be introduced
    pub fn dispatch_nat_relay(
        &self,
        local: &PeerId,
        remote: &PeerId,
        extra: &str,
    ) -> Option<NatRelayTarget> {
        let handler = read_lock(&self.endpoints)
            .ok()?
            .nat_relay
            .as_ref()
            .map(|slot| slot.handler.clone())?;

        match guarded("nat-relay", || Ok(handler(local, remote, extra))) {
            Ok(target) => target,
            Err(e) => {
                self.report(remote, None, &e);
                None
            }
        }
    }

    fn report(&self, peer: &PeerId, packet: Option<&Packet>, error: &NetError) {
        self.metrics.dispatch_error();
        events::record(NetEvent::HandlerFailure, Some(peer), packet, Some(error));
    }
}
