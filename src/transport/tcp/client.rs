use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{info, instrument, warn};

use crate::config::NetworkConfig;
use crate::error::{NetError, Result};
use crate::protocol::client::ClientCore;
use crate::protocol::handshake::{read_status, ConnectStatus, ConnectionState};
use crate::transport::tcp::session::{spawn_session, SessionLimits, TcpLink};
use crate::utils::timeout::with_timeout_error;

/// Stream client.
///
/// Derefs to [`ClientCore`] for sending, requests, registration and `close`.
///
/// ```no_run
/// # async fn run() -> tagwire::error::Result<()> {
/// use std::time::Duration;
/// use tagwire::config::NetworkConfig;
/// use tagwire::transport::tcp::TcpClient;
///
/// let client = TcpClient::new(NetworkConfig::default());
/// let owner = client.registry().owner();
/// client.registry().on_receive::<String, _>(owner, "chat", |msg| {
///     println!("{msg:?}");
/// })?;
///
/// if client.connect(Duration::from_secs(5)).await.is_connected() {
///     let reply: Option<String> = client
///         .request("echo", Some("hello"), Duration::from_secs(2))
///         .await?;
///     println!("{reply:?}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct TcpClient {
    core: Arc<ClientCore>,
    config: NetworkConfig,
}

impl TcpClient {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            core: Arc::new(ClientCore::with_request_timeout(config.client.request_timeout)),
            config,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Connect to `config.client.address` and wait for the accept status.
    ///
    /// Failures are reported through the returned state: `TimedOut` when no status
    /// arrived in time, `Full` when the server is at capacity, `Failed` otherwise.
    #[instrument(skip(self), fields(address = %self.config.client.address))]
    pub async fn connect(&self, timeout: Duration) -> ConnectionState {
        if self.core.is_connected() {
            return ConnectionState::Connected;
        }
        self.core.set_state(ConnectionState::Connecting);

        let address = self.config.client.address.clone();
        let attempt = async move {
            let mut stream = TcpStream::connect(&address).await?;
            let status = read_status(&mut stream).await?;
            Ok::<_, NetError>((stream, status))
        };

        let state = match with_timeout_error(attempt, timeout, "connect").await {
            Ok((stream, ConnectStatus::Ok)) => match self.start(stream) {
                Ok(()) => ConnectionState::Connected,
                Err(e) => {
                    warn!(error = %e, "Could not start session");
                    ConnectionState::Failed
                }
            },
            Ok((_, status)) => {
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
            self.core.set_state(state);
        }
        state
    }

    /// Connect using `config.client.connection_timeout`
    pub async fn connect_default(&self) -> ConnectionState {
        self.connect(self.config.client.connection_timeout).await
    }

    fn start(&self, stream: TcpStream) -> Result<()> {
        let (link, reader) = TcpLink::from_stream(stream)?;
        // Attach before the reader runs so an immediate hang-up is still reported
        self.core.attach(link.clone());
        spawn_session(
            link,
            reader,
            self.core.clone(),
            SessionLimits {
                read_buffer_size: self.config.transport.read_buffer_size,
                queue_limit: self.config.client.backpressure_limit,
            },
            Box::pin(async {}),
        );
        Ok(())
    }
}

impl Deref for TcpClient {
    type Target = ClientCore;

    fn deref(&self) -> &ClientCore {
        &self.core
    }
}
