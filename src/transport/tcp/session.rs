//! One TCP session: a framed write half behind a lock, a reader task that
//! reassembles frames from raw reads, and a dispatch task that delivers them in
//! order.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::SinkExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::core::peer::PeerId;
use crate::core::reassembly::FrameAssembler;
use crate::error::{NetError, Result};
use crate::protocol::handshake::{write_status, ConnectStatus, DisconnectReason};
use crate::transport::{Link, PacketSink};

/// Write side of a TCP session
pub struct TcpLink {
    peer: PeerId,
    writer: Mutex<FramedWrite<OwnedWriteHalf, PacketCodec>>,
    open: AtomicBool,
    cancel: CancellationToken,
}

impl TcpLink {
    /// Split a connected stream into its link and the read half for [`spawn_session`]
    pub fn from_stream(stream: TcpStream) -> io::Result<(Arc<Self>, OwnedReadHalf)> {
        stream.set_nodelay(true)?;
        let peer = PeerId::from(stream.peer_addr()?);
        let (reader, writer) = stream.into_split();
        let link = Arc::new(Self {
            peer,
            writer: Mutex::new(FramedWrite::new(writer, PacketCodec::new())),
            open: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        });
        Ok((link, reader))
    }

    /// Decide and write the accept status while holding the write lock, so no frame
    /// can reach the peer ahead of it.
    pub(crate) async fn accept_with<F>(&self, decide: F) -> io::Result<ConnectStatus>
    where
        F: FnOnce() -> ConnectStatus,
    {
        let mut writer = self.writer.lock().await;
        let status = decide();
        write_status(writer.get_mut(), status).await?;
        Ok(status)
    }
}

impl Link for TcpLink {
    fn peer_id(&self) -> PeerId {
        self.peer
    }

    fn send_packet(&self, packet: Packet) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(NetError::NotConnected);
            }
            packet.validate()?;
            let mut writer = self.writer.lock().await;
            writer.send(packet).await
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.open.swap(false, Ordering::SeqCst) {
                return;
            }
            self.cancel.cancel();
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.get_mut().shutdown().await {
                trace!(peer = %self.peer, error = %e, "Shutdown of write half failed");
            }
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Session tuning taken from the transport configuration
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub read_buffer_size: usize,
    pub queue_limit: usize,
}

/// Start the reader and dispatch tasks for `link`.
///
/// The dispatch task runs `prelude` before the first packet. When the reader
/// stops, queued packets are still delivered, then the link is closed and
/// `sink.ended` is called exactly once.
pub fn spawn_session(
    link: Arc<TcpLink>,
    reader: OwnedReadHalf,
    sink: Arc<dyn PacketSink>,
    limits: SessionLimits,
    prelude: BoxFuture<'static, ()>,
) {
    let (queue_tx, mut queue_rx) = mpsc::channel::<Packet>(limits.queue_limit.max(1));
    let cancel = link.cancel.clone();
    let dyn_link: Arc<dyn Link> = link;

    let dispatch = {
        let link = dyn_link.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            prelude.await;
            while let Some(packet) = queue_rx.recv().await {
                sink.handle(&link, packet).await;
            }
        })
    };

    tokio::spawn(async move {
        let reason = read_loop(reader, &dyn_link, sink.as_ref(), &cancel, limits, queue_tx).await;
        debug!(peer = %dyn_link.peer_id(), ?reason, "Reader stopped");

        if let Err(e) = dispatch.await {
            debug!(peer = %dyn_link.peer_id(), error = %e, "Dispatch task aborted");
        }
        dyn_link.close().await;
        sink.ended(&dyn_link, reason);
    });
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    link: &Arc<dyn Link>,
    sink: &dyn PacketSink,
    cancel: &CancellationToken,
    limits: SessionLimits,
    queue: mpsc::Sender<Packet>,
) -> DisconnectReason {
    let peer = link.peer_id();
    let mut buf = vec![0u8; limits.read_buffer_size.max(1)];
    let mut assembler = FrameAssembler::new();

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return DisconnectReason::LocalClose,
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => return DisconnectReason::RemoteConnectionClose,
            Ok(n) => n,
            Err(e) => {
                debug!(%peer, error = %e, "Read failed");
                return DisconnectReason::from_io(&e);
            }
        };

        for frame in assembler.feed(&buf[..n]) {
            match frame {
                Ok(packet) => {
                    if sink.resolve(&packet) {
                        continue;
                    }
                    // Bounded: a slow handler pushes back on the socket
                    if queue.send(packet).await.is_err() {
                        return DisconnectReason::LocalClose;
                    }
                }
                Err(e) => sink.malformed(&peer, &e),
            }
        }
    }
}
