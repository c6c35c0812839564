//! Connection handshake and session lifecycle states.
//!
//! A stream server answers every accepted connection with a 4-byte little-endian
//! status code before any frame is written. The client reads it before starting its
//! reader loop. Datagram connections report the same statuses through the engine's
//! accept/reject datagrams.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetError, Result};

/// Size of the status code written on accept
pub const STATUS_SIZE: usize = 4;

/// Server's answer to a connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ConnectStatus {
    Ok = 0,
    Full = 1,
    NotListening = 2,
    Error = 3,
}

impl ConnectStatus {
    /// Unknown codes are read as `Error`
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => ConnectStatus::Ok,
            1 => ConnectStatus::Full,
            2 => ConnectStatus::NotListening,
            _ => ConnectStatus::Error,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn to_bytes(self) -> [u8; STATUS_SIZE] {
        self.code().to_le_bytes()
    }
}

/// Client-side connection state machine.
///
/// `Disconnected → Connecting → {Connected, TimedOut, Full, Failed}` and
/// `Connected → Disconnected`. Every state but `Connected` needs a fresh `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    TimedOut,
    Full,
    Failed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl From<ConnectStatus> for ConnectionState {
    fn from(status: ConnectStatus) -> Self {
        match status {
            ConnectStatus::Ok => ConnectionState::Connected,
            ConnectStatus::Full => ConnectionState::Full,
            ConnectStatus::NotListening | ConnectStatus::Error => ConnectionState::Failed,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The remote side closed the connection
    RemoteConnectionClose,
    /// This side closed the connection
    LocalClose,
    /// The connection was reset or aborted
    ConnectionReset,
    /// The peer stopped answering
    Timeout,
    /// The connection could not be established
    ConnectionFailed,
    /// Any other I/O failure
    NetworkError,
}

impl DisconnectReason {
    /// Best-available reason for a fatal I/O error
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => DisconnectReason::RemoteConnectionClose,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => DisconnectReason::ConnectionReset,
            io::ErrorKind::TimedOut => DisconnectReason::Timeout,
            io::ErrorKind::ConnectionRefused | io::ErrorKind::NotConnected => {
                DisconnectReason::ConnectionFailed
            }
            _ => DisconnectReason::NetworkError,
        }
    }
}

/// Write the accept status to a freshly accepted stream
pub async fn write_status<W>(writer: &mut W, status: ConnectStatus) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&status.to_bytes()).await?;
    writer.flush().await
}

/// Read the accept status sent by a stream server
pub async fn read_status<R>(reader: &mut R) -> Result<ConnectStatus>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; STATUS_SIZE];
    reader.read_exact(&mut buf).await.map_err(NetError::Io)?;
    Ok(ConnectStatus::from_code(u32::from_le_bytes(buf)))
}
