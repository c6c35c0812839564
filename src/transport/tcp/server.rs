use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::error::Result;
use crate::protocol::handshake::ConnectStatus;
use crate::protocol::server::ServerCore;
use crate::transport::peers::Admission;
use crate::transport::tcp::session::{spawn_session, SessionLimits, TcpLink};
use crate::transport::Link;
use crate::utils::metrics::Timer;
use crate::utils::timeout::with_timeout_error;

/// Stream server.
///
/// Derefs to [`ServerCore`] for registration, `send_to`, broadcasts and peer
/// management.
pub struct TcpServer {
    core: Arc<ServerCore>,
    config: NetworkConfig,
    // Replaced on every listen; cancelled while not listening
    shutdown: Mutex<CancellationToken>,
}

impl TcpServer {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            core: Arc::new(ServerCore::new(config.server.max_peers)),
            config,
            shutdown: Mutex::new(stopped()),
        }
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Bind `config.server.address` and start accepting in the background.
    ///
    /// Returns the bound address, which differs from the configured one when port 0
    /// was requested. Listening again, also after [`TcpServer::close`], replaces the
    /// previous accept loop.
    #[instrument(skip(self), fields(address = %self.config.server.address))]
    pub async fn listen(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.server.address).await?;
        let local = listener.local_addr()?;
        info!(%local, max_peers = self.config.server.max_peers, "Listening");

        let core = self.core.clone();
        let shutdown = CancellationToken::new();
        let previous = std::mem::replace(
            &mut *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner),
            shutdown.clone(),
        );
        previous.cancel();
        let limits = SessionLimits {
            read_buffer_size: self.config.transport.read_buffer_size,
            queue_limit: self.config.server.backpressure_limit,
        };
        tokio::spawn(accept_loop(listener, core, shutdown, limits));
        Ok(local)
    }

    /// Stop accepting and disconnect every peer with `LocalClose`
    pub async fn close(&self) -> Result<usize> {
        let _timer = Timer::start("tcp_server_close");
        self.shutdown_token().cancel();
        let core = self.core.clone();
        let dropped = with_timeout_error(
            async move { Ok(core.disconnect_all().await) },
            self.config.server.shutdown_timeout,
            "shutdown",
        )
        .await?;
        info!(dropped, "Server closed");
        self.core.metrics().log_metrics();
        Ok(dropped)
    }

    pub fn is_listening(&self) -> bool {
        !self.shutdown_token().is_cancelled()
    }
}

fn stopped() -> CancellationToken {
    let token = CancellationToken::new();
    token.cancel();
    token
}

impl Deref for TcpServer {
    type Target = ServerCore;

    fn deref(&self) -> &ServerCore {
        &self.core
    }
}

async fn accept_loop(
    listener: TcpListener,
    core: Arc<ServerCore>,
    shutdown: CancellationToken,
    limits: SessionLimits,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!(%addr, "Accepted connection");
                let core = core.clone();
                tokio::spawn(async move {
                    if let Err(e) = admit(stream, core.clone(), limits).await {
                        core.metrics().connection_error();
                        warn!(%addr, error = %e, "Handshake failed");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                core.metrics().connection_error();
            }
        }
    }
    info!("Accept loop stopped");
}

async fn admit(stream: TcpStream, core: Arc<ServerCore>, limits: SessionLimits) -> Result<()> {
    let (link, reader) = TcpLink::from_stream(stream)?;
    let dyn_link: Arc<dyn Link> = link.clone();
    let peer = link.peer_id();

    let decided = link
        .accept_with(|| match core.admit(dyn_link.clone()) {
            Admission::Admitted => ConnectStatus::Ok,
            Admission::Full => ConnectStatus::Full,
            Admission::Duplicate => ConnectStatus::Error,
        })
        .await;

    match decided {
        Ok(ConnectStatus::Ok) => {
            let announcer = core.clone();
            let prelude = Box::pin(async move { announcer.announce(peer).await });
            spawn_session(link, reader, core, limits, prelude);
            Ok(())
        }
        Ok(status) => {
            debug!(%peer, ?status, "Closing refused connection");
            link.close().await;
            Ok(())
        }
        Err(e) => {
            // The slot may have been taken before the write failed
            core.release(&dyn_link);
            link.close().await;
            Err(e.into())
        }
    }
}
