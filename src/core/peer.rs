//! Address-based peer identity.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Identifies the remote end of a session by address and port.
///
/// Used as the key of the live-peer table and in NAT relay arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    address: IpAddr,
    port: u16,
}

impl PeerId {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<SocketAddr> for PeerId {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<PeerId> for SocketAddr {
    fn from(peer: PeerId) -> Self {
        peer.socket_addr()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    #[test]
    fn structural_equality_and_hash() {
        let a = PeerId::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);
        let b: PeerId = "127.0.0.1:9000".parse::<SocketAddr>().map(PeerId::from).unwrap();
        assert_eq!(a, b);

        let mut table = HashMap::new();
        table.insert(a, "first");
        assert_eq!(table.get(&b), Some(&"first"));
    }

    #[test]
    fn display_matches_socket_addr() {
        let peer = PeerId::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 4242);
        assert_eq!(peer.to_string(), "10.0.0.7:4242");
        assert_eq!(SocketAddr::from(peer).port(), 4242);
    }
}
