//! Token-based pairing for NAT rendezvous.
//!
//! The first client to ask with a given token waits; the second one is introduced
//! to it. Plug it into the relay handler:
//!
//! ```
//! use std::sync::Arc;
//! use tagwire::protocol::dispatcher::ServerRegistry;
//! use tagwire::transport::udp::NatPairing;
//!
//! let registry = ServerRegistry::default();
//! let pairing = Arc::new(NatPairing::new());
//! let owner = registry.owner();
//! let relay = pairing.clone();
//! registry
//!     .on_nat_relay(owner, move |local, remote, token| relay.pair(local, remote, token))
//!     .unwrap();
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::core::peer::PeerId;
use crate::protocol::dispatcher::NatRelayTarget;

#[derive(Debug, Default)]
pub struct NatPairing {
    waiting: Mutex<HashMap<String, NatRelayTarget>>,
}

impl NatPairing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `remote` under `token`.
    ///
    /// Returns the party waiting on the same token, if any, and forgets it. A repeat
    /// request from the waiting party itself only refreshes its addresses.
    pub fn pair(&self, local: &PeerId, remote: &PeerId, token: &str) -> Option<NatRelayTarget> {
        let me = NatRelayTarget {
            local: *local,
            remote: *remote,
        };
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        let paired = waiting
            .get(token)
            .is_some_and(|other| other.remote != *remote);
        if paired {
            debug!(%remote, token, "Paired NAT rendezvous");
            return waiting.remove(token);
        }
        waiting.insert(token.to_string(), me);
        None
    }

    /// Tokens with a party still waiting
    pub fn pending(&self) -> usize {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Forget the party waiting on `token`
    pub fn cancel(&self, token: &str) -> bool {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some()
    }
}
