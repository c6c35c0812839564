//! Structured traffic and lifecycle events.
//!
//! Every event is emitted through `tracing` with the same field set
//! (`event`, `peer`, `kind`, `tag`, `error`), so any subscriber can filter or index
//! them without knowing the call site.

use tracing::{debug, info, trace, warn};

use crate::core::packet::Packet;
use crate::core::peer::PeerId;
use crate::error::NetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetEvent {
    Connect,
    Disconnect,
    Send,
    RequestTo,
    RequestFrom,
    ResponseTo,
    ResponseFrom,
    Receive,
    MalformedPacket,
    UnknownEndpoint,
    HandlerFailure,
}

impl NetEvent {
    pub fn name(self) -> &'static str {
        match self {
            NetEvent::Connect => "connect",
            NetEvent::Disconnect => "disconnect",
            NetEvent::Send => "send",
            NetEvent::RequestTo => "request-to",
            NetEvent::RequestFrom => "request-from",
            NetEvent::ResponseTo => "response-to",
            NetEvent::ResponseFrom => "response-from",
            NetEvent::Receive => "receive",
            NetEvent::MalformedPacket => "malformed-packet",
            NetEvent::UnknownEndpoint => "unknown-endpoint",
            NetEvent::HandlerFailure => "handler-failure",
        }
    }
}

/// Emit one event
pub fn record(
    event: NetEvent,
    peer: Option<&PeerId>,
    packet: Option<&Packet>,
    error: Option<&NetError>,
) {
    let name = event.name();
    let peer = peer.map(|p| p.to_string()).unwrap_or_default();
    let kind = packet.map(|p| p.kind.name()).unwrap_or_default();
    let tag = packet.map(|p| p.tag.as_str()).unwrap_or_default();
    let bytes = packet.map(|p| p.payload_bytes().len()).unwrap_or_default();
    let error = error.map(|e| e.to_string()).unwrap_or_default();

    match event {
        NetEvent::Connect | NetEvent::Disconnect => {
            info!(event = name, %peer, %error, "Session lifecycle");
        }
        NetEvent::MalformedPacket | NetEvent::HandlerFailure => {
            warn!(event = name, %peer, kind, tag, %error, "Inbound packet failed");
        }
        NetEvent::UnknownEndpoint => {
            debug!(event = name, %peer, kind, tag, "No endpoint registered for tag");
        }
        _ => {
            trace!(event = name, %peer, kind, tag, bytes, %error, "Packet traffic");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_are_kebab_case() {
        assert_eq!(NetEvent::RequestTo.name(), "request-to");
        assert_eq!(NetEvent::MalformedPacket.name(), "malformed-packet");
    }

    #[test]
    fn record_without_subscriber_is_harmless() {
        let packet = Packet::send("tick", None);
        record(NetEvent::Send, None, Some(&packet), None);
        record(
            NetEvent::MalformedPacket,
            None,
            None,
            Some(&NetError::MalformedFrame("short".into())),
        );
    }
}
