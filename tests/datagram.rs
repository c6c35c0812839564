//! UDP sessions: handshake, delivery methods, lifecycle and NAT rendezvous

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serial_test::serial;
use tagwire::{
    ConnectionState, DeliveryMethod, DisconnectReason, NatPairing, NetError, NetworkConfig,
    PeerId, UdpClient, UdpServer,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn tuned(config: &mut NetworkConfig) {
    config.transport.ping_interval = Duration::from_millis(50);
    config.transport.disconnect_timeout = Duration::from_secs(2);
    config.transport.resend_interval = Duration::from_millis(20);
}

fn server_with(max_peers: usize, key: &str) -> UdpServer {
    UdpServer::new(NetworkConfig::default_with_overrides(|c| {
        tuned(c);
        c.server.address = "127.0.0.1:0".into();
        c.server.max_peers = max_peers;
        c.transport.connection_key = key.to_string();
    }))
}

fn client_for(addr: SocketAddr, key: &str) -> UdpClient {
    UdpClient::new(NetworkConfig::default_with_overrides(|c| {
        tuned(c);
        c.client.address = addr.to_string();
        c.transport.connection_key = key.to_string();
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_udp_echo_request() {
    let server = server_with(8, "");
    let owner = server.registry().owner();
    server
        .registry()
        .on_request::<String, String, _>(owner, "echo", |_peer, msg| msg.map(|m| m.to_uppercase()))
        .unwrap();
    let addr = server.listen().await.unwrap();
    assert!(server.is_listening());

    let client = client_for(addr, "");
    assert_eq!(client.connect(WAIT).await, ConnectionState::Connected);
    assert!(client.local_addr().is_some());

    let reply: Option<String> = client.request("echo", Some("quiet"), WAIT).await.unwrap();
    assert_eq!(reply.as_deref(), Some("QUIET"));

    let empty = client.request_raw("unregistered", None, WAIT).await.unwrap();
    assert!(empty.is_none());

    assert!(client.close().await);
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_every_delivery_method_arrives() {
    let server = server_with(8, "");
    let owner = server.registry().owner();
    let (tx, mut rx) = mpsc::unbounded_channel::<(PeerId, String)>();
    server
        .registry()
        .on_receive::<String, _>(owner, "note", move |peer, note| {
            let _ = tx.send((*peer, note.unwrap_or_default()));
        })
        .unwrap();
    let addr = server.listen().await.unwrap();

    let client = client_for(addr, "");
    assert!(client.connect(WAIT).await.is_connected());

    for method in [
        DeliveryMethod::Unreliable,
        DeliveryMethod::ReliableUnordered,
        DeliveryMethod::ReliableOrdered,
    ] {
        let text = format!("{method:?}");
        client.send_with("note", Some(text.as_str()), method).await.unwrap();
        let (_, note) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(note, text);
    }

    // Plain send defaults to reliable ordered
    for i in 0..50 {
        client.send("note", Some(&i.to_string())).await.unwrap();
    }
    let mut peer = None;
    for i in 0..50 {
        let (from, note) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(note, i.to_string());
        peer = Some(from);
    }

    // And back the other way
    let peer = peer.unwrap();
    let (ctx, mut crx) = mpsc::unbounded_channel::<Option<Bytes>>();
    let client_owner = client.registry().owner();
    client
        .registry()
        .on_receive_raw(client_owner, "ack", move |payload| {
            let _ = ctx.send(payload.cloned());
        })
        .unwrap();
    server
        .send_with_raw(&peer, "ack", Some(Bytes::from_static(b"ok")), DeliveryMethod::ReliableUnordered)
        .await
        .unwrap();
    let got = timeout(WAIT, crx.recv()).await.unwrap().unwrap();
    assert_eq!(got.as_deref(), Some(&b"ok"[..]));

    assert!(server
        .broadcast_with("ack", Some("all"), DeliveryMethod::ReliableOrdered)
        .await
        .unwrap());
    assert!(timeout(WAIT, crx.recv()).await.unwrap().unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_oversized_datagram_is_refused() {
    let server = server_with(8, "");
    let addr = server.listen().await.unwrap();
    let client = client_for(addr, "");
    assert!(client.connect(WAIT).await.is_connected());

    let big = Bytes::from(vec![7u8; 4000]);
    let result = client.send_raw("blob", Some(big)).await;
    assert!(matches!(result, Err(NetError::OversizedPacket(_))));

    // The session survives the refused send
    let reply = client.request_raw("anything", None, WAIT).await.unwrap();
    assert!(reply.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_oversized_reply_is_answered_empty() {
    let server = server_with(8, "");
    let owner = server.registry().owner();
    server
        .registry()
        .on_request_raw(owner, "big", |_peer, _payload| Some(Bytes::from(vec![3u8; 2000])))
        .unwrap();
    server
        .registry()
        .on_request::<String, String, _>(owner, "echo", |_peer, msg| msg)
        .unwrap();
    let addr = server.listen().await.unwrap();
    let client = client_for(addr, "");
    assert!(client.connect(WAIT).await.is_connected());

    let started = std::time::Instant::now();
    let reply = client.request_raw("big", None, Duration::from_secs(2)).await.unwrap();
    assert!(reply.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(server.metrics().snapshot().dispatch_errors, 1);

    let reply: Option<String> = client.request("echo", Some("after"), WAIT).await.unwrap();
    assert_eq!(reply.as_deref(), Some("after"));
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_slow_handler_does_not_hold_up_other_peers() {
    let server = server_with(8, "");
    let owner = server.registry().owner();
    server
        .registry()
        .on_receive_raw(owner, "crunch", |_peer, _payload| {
            std::thread::sleep(Duration::from_millis(1500));
        })
        .unwrap();
    server
        .registry()
        .on_request::<String, String, _>(owner, "echo", |_peer, msg| msg)
        .unwrap();
    let addr = server.listen().await.unwrap();

    let busy = client_for(addr, "");
    let other = client_for(addr, "");
    assert!(busy.connect(WAIT).await.is_connected());
    assert!(other.connect(WAIT).await.is_connected());

    busy.send_raw("crunch", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reply: Option<String> = other
        .request("echo", Some("still here"), Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(reply.as_deref(), Some("still here"));
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_full_server_rejects() {
    let server = server_with(1, "");
    let addr = server.listen().await.unwrap();

    let first = client_for(addr, "");
    assert!(first.connect(WAIT).await.is_connected());

    let second = client_for(addr, "");
    assert_eq!(second.connect(WAIT).await, ConnectionState::Full);
    assert_eq!(server.peer_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_wrong_connection_key_fails() {
    let server = server_with(8, "right");
    let addr = server.listen().await.unwrap();

    let wrong = client_for(addr, "wrong");
    assert_eq!(wrong.connect(WAIT).await, ConnectionState::Failed);

    let right = client_for(addr, "right");
    assert_eq!(right.connect(WAIT).await, ConnectionState::Connected);
}

#[tokio::test]
#[serial]
async fn test_no_server_times_out() {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    // Something is bound but never answers
    let client = client_for(addr, "");
    assert_eq!(
        client.connect(Duration::from_millis(300)).await,
        ConnectionState::TimedOut
    );
    drop(socket);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_disconnects_propagate_once() {
    let server = server_with(8, "");
    let owner = server.registry().owner();
    let (tx, mut rx) = mpsc::unbounded_channel::<(PeerId, DisconnectReason)>();
    server
        .registry()
        .on_disconnect(owner, move |peer, reason| {
            let _ = tx.send((*peer, reason));
        })
        .unwrap();
    let (ctx, mut crx) = mpsc::unbounded_channel::<PeerId>();
    server
        .registry()
        .on_connect(owner, move |peer| {
            let _ = ctx.send(*peer);
        })
        .unwrap();
    let addr = server.listen().await.unwrap();

    // Client leaves
    let leaver = client_for(addr, "");
    assert!(leaver.connect(WAIT).await.is_connected());
    let leaver_id = timeout(WAIT, crx.recv()).await.unwrap().unwrap();
    assert!(leaver.close().await);
    let (peer, reason) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(peer, leaver_id);
    assert_eq!(reason, DisconnectReason::RemoteConnectionClose);

    // Server kicks
    let kicked = client_for(addr, "");
    let (ktx, mut krx) = mpsc::unbounded_channel::<DisconnectReason>();
    let kicked_owner = kicked.registry().owner();
    kicked
        .registry()
        .on_disconnect(kicked_owner, move |reason| {
            let _ = ktx.send(reason);
        })
        .unwrap();
    assert!(kicked.connect(WAIT).await.is_connected());
    let kicked_id = timeout(WAIT, crx.recv()).await.unwrap().unwrap();
    assert!(server.disconnect_peer(&kicked_id).await);

    let (_, reason) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(reason, DisconnectReason::LocalClose);
    assert_eq!(
        timeout(WAIT, krx.recv()).await.unwrap().unwrap(),
        DisconnectReason::RemoteConnectionClose
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
    assert!(krx.try_recv().is_err());
    assert_eq!(server.peer_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_nat_rendezvous_pairs_two_clients() {
    let server = server_with(8, "");
    let pairing = Arc::new(NatPairing::new());
    let owner = server.registry().owner();
    let relay = pairing.clone();
    server
        .registry()
        .on_nat_relay(owner, move |local, remote, token| relay.pair(local, remote, token))
        .unwrap();
    let relay_addr = server.listen().await.unwrap();

    let host = Arc::new(client_for(relay_addr, ""));
    let guest = client_for(relay_addr, "");

    let waiting = {
        let host = host.clone();
        tokio::spawn(async move { host.nat_introduction(relay_addr, "room-7", WAIT).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pairing.pending(), 1);

    let host_seen_by_guest = guest.nat_introduction(relay_addr, "room-7", WAIT).await.unwrap();
    let guest_seen_by_host = waiting.await.unwrap().unwrap();

    assert_eq!(Some(host_seen_by_guest.socket_addr()), host.local_addr());
    assert_eq!(Some(guest_seen_by_host.socket_addr()), guest.local_addr());
    assert_eq!(pairing.pending(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_nat_introduction_times_out_without_partner() {
    let server = server_with(8, "");
    let pairing = Arc::new(NatPairing::new());
    let owner = server.registry().owner();
    let relay = pairing.clone();
    server
        .registry()
        .on_nat_relay(owner, move |local, remote, token| relay.pair(local, remote, token))
        .unwrap();
    let relay_addr = server.listen().await.unwrap();

    let lonely = client_for(relay_addr, "");
    let result = lonely
        .nat_introduction(relay_addr, "empty-room", Duration::from_millis(300))
        .await;
    assert!(matches!(result, Err(NetError::Timeout(_))));
}
