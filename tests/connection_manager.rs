//! Server capacity, disconnect propagation and broadcast over TCP

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serial_test::serial;
use tagwire::{ConnectionState, DisconnectReason, NetError, NetworkConfig, PeerId, TcpClient, TcpServer};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn server_with(max_peers: usize) -> TcpServer {
    TcpServer::new(NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".into();
        c.server.max_peers = max_peers;
    }))
}

fn client_for(addr: SocketAddr) -> TcpClient {
    TcpClient::new(NetworkConfig::default_with_overrides(|c| {
        c.client.address = addr.to_string();
    }))
}

/// Connect handler feeding peer ids into a channel
fn watch_connects(server: &TcpServer) -> mpsc::UnboundedReceiver<PeerId> {
    let (tx, rx) = mpsc::unbounded_channel();
    let owner = server.registry().owner();
    server
        .registry()
        .on_connect(owner, move |peer| {
            let _ = tx.send(*peer);
        })
        .unwrap();
    rx
}

fn watch_server_disconnects(server: &TcpServer) -> mpsc::UnboundedReceiver<(PeerId, DisconnectReason)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let owner = server.registry().owner();
    server
        .registry()
        .on_disconnect(owner, move |peer, reason| {
            let _ = tx.send((*peer, reason));
        })
        .unwrap();
    rx
}

fn watch_client_disconnects(client: &TcpClient) -> Arc<Mutex<Vec<DisconnectReason>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let owner = client.registry().owner();
    client
        .registry()
        .on_disconnect(owner, move |reason| sink.lock().unwrap().push(reason))
        .unwrap();
    seen
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_full_server_rejects_with_full() {
    let server = server_with(1);
    let addr = server.listen().await.unwrap();

    let first = client_for(addr);
    assert_eq!(first.connect(WAIT).await, ConnectionState::Connected);

    let second = client_for(addr);
    assert_eq!(second.connect(WAIT).await, ConnectionState::Full);
    assert_eq!(second.state(), ConnectionState::Full);
    assert_eq!(server.peer_count(), 1);
    assert_eq!(server.metrics().snapshot().connections_rejected, 1);

    // The slot frees up once the first client leaves
    assert!(first.close().await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(second.connect(WAIT).await, ConnectionState::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_client_close_reaches_server_once() {
    let server = server_with(8);
    let mut connects = watch_connects(&server);
    let mut disconnects = watch_server_disconnects(&server);
    let addr = server.listen().await.unwrap();

    let client = client_for(addr);
    let client_seen = watch_client_disconnects(&client);
    assert!(client.connect(WAIT).await.is_connected());
    let peer = timeout(WAIT, connects.recv()).await.unwrap().unwrap();

    assert!(client.close().await);
    assert!(!client.close().await);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let (gone, reason) = timeout(WAIT, disconnects.recv()).await.unwrap().unwrap();
    assert_eq!(gone, peer);
    assert_eq!(reason, DisconnectReason::RemoteConnectionClose);
    assert!(!server.is_connected(&peer));

    // No second notification on either side
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(disconnects.try_recv().is_err());
    assert_eq!(*client_seen.lock().unwrap(), vec![DisconnectReason::LocalClose]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_server_kick_reaches_client_once() {
    let server = server_with(8);
    let mut connects = watch_connects(&server);
    let mut disconnects = watch_server_disconnects(&server);
    let addr = server.listen().await.unwrap();

    let client = client_for(addr);
    let client_seen = watch_client_disconnects(&client);
    assert!(client.connect(WAIT).await.is_connected());
    let peer = timeout(WAIT, connects.recv()).await.unwrap().unwrap();

    assert!(server.disconnect_peer(&peer).await);
    assert!(!server.disconnect_peer(&peer).await);

    let (_, reason) = timeout(WAIT, disconnects.recv()).await.unwrap().unwrap();
    assert_eq!(reason, DisconnectReason::LocalClose);

    let deadline = tokio::time::Instant::now() + WAIT;
    while client.is_connected() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        *client_seen.lock().unwrap(),
        vec![DisconnectReason::RemoteConnectionClose]
    );
    assert!(disconnects.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_broadcast_except_skips_one_peer() {
    let server = server_with(8);
    let mut connects = watch_connects(&server);
    let addr = server.listen().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<usize>();
    let mut clients = Vec::new();
    let mut peers = Vec::new();
    for i in 0..3 {
        let client = client_for(addr);
        let tx = tx.clone();
        let owner = client.registry().owner();
        client
            .registry()
            .on_receive_raw(owner, "news", move |_| {
                let _ = tx.send(i);
            })
            .unwrap();
        assert!(client.connect(WAIT).await.is_connected());
        peers.push(timeout(WAIT, connects.recv()).await.unwrap().unwrap());
        clients.push(client);
    }

    let all_sent = server
        .broadcast_except(&peers[1], "news", Some("extra"))
        .await
        .unwrap();
    assert!(all_sent);

    let mut got = vec![
        timeout(WAIT, rx.recv()).await.unwrap().unwrap(),
        timeout(WAIT, rx.recv()).await.unwrap().unwrap(),
    ];
    got.sort_unstable();
    assert_eq!(got, vec![0, 2]);

    assert!(server.broadcast::<str>("news", None).await.unwrap());
    let mut got: Vec<usize> = Vec::new();
    for _ in 0..3 {
        got.push(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    got.sort_unstable();
    assert_eq!(got, vec![0, 1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_server_close_disconnects_everyone() {
    let server = server_with(8);
    let mut disconnects = watch_server_disconnects(&server);
    let addr = server.listen().await.unwrap();

    let clients: Vec<TcpClient> = (0..3).map(|_| client_for(addr)).collect();
    for client in &clients {
        assert!(client.connect(WAIT).await.is_connected());
    }

    assert_eq!(server.close().await.unwrap(), 3);
    assert!(!server.is_listening());
    for _ in 0..3 {
        let (_, reason) = timeout(WAIT, disconnects.recv()).await.unwrap().unwrap();
        assert_eq!(reason, DisconnectReason::LocalClose);
    }
    assert_eq!(server.peer_count(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    for client in &clients {
        assert!(!client.is_connected());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_server_listens_again_after_close() {
    let server = server_with(8);
    assert!(!server.is_listening());
    let owner = server.registry().owner();
    server
        .registry()
        .on_request_raw(owner, "ping", |_, _| Some(Bytes::from_static(b"pong")))
        .unwrap();

    server.listen().await.unwrap();
    assert!(server.is_listening());
    server.close().await.unwrap();
    assert!(!server.is_listening());

    let second = server.listen().await.unwrap();
    assert!(server.is_listening());

    let client = client_for(second);
    assert_eq!(client.connect(WAIT).await, ConnectionState::Connected);
    let reply = client.request_raw("ping", None, WAIT).await.unwrap();
    assert_eq!(reply.as_deref(), Some(&b"pong"[..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_close_cancels_pending_requests() {
    let server = server_with(8);
    let owner = server.registry().owner();
    server
        .registry()
        .on_request_raw(owner, "stall", |_, _| {
            std::thread::sleep(Duration::from_millis(500));
            None
        })
        .unwrap();
    let addr = server.listen().await.unwrap();

    let client = Arc::new(client_for(addr));
    assert!(client.connect(WAIT).await.is_connected());

    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request_raw("stall", Some(Bytes::from_static(b"x")), WAIT)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.close().await);

    let result = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(NetError::Cancelled(_))));
}

#[tokio::test]
#[serial]
async fn test_connect_to_closed_port_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client_for(addr);
    assert_eq!(client.connect(WAIT).await, ConnectionState::Failed);
    assert!(!client.is_connected());
}
