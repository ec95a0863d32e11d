//! Connection providers.
//!
//! A [`ConnectionProvider`] knows how to dial the warden daemon and produce
//! a fresh [`Connection`]. The pool in [`crate::Client`] owns one provider
//! and calls it whenever it needs a new connection, so swapping the
//! transport (Unix socket, TCP, or an in-memory fake in tests) is a matter
//! of handing the client a different provider.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use crate::connection::Connection;
use crate::error::Result;

/// Dials the warden daemon on demand.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Opens a new connection to the server.
    async fn provide(&self) -> Result<Connection>;
}

/// Connects over a Unix-domain stream socket. This is the canonical way to
/// reach a warden daemon on the same host.
#[derive(Debug, Clone)]
pub struct UnixSocketProvider {
    /// Filesystem path of the daemon's listening socket.
    pub socket_path: PathBuf,
}

impl UnixSocketProvider {
    /// Creates a provider for the daemon socket at `socket_path`.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }
}

#[async_trait]
impl ConnectionProvider for UnixSocketProvider {
    async fn provide(&self) -> Result<Connection> {
        debug!(path = %self.socket_path.display(), "dialing warden over unix socket");
        let stream = UnixStream::connect(&self.socket_path).await?;
        Ok(Connection::new(stream))
    }
}

/// Connects over TCP, for daemons listening on a network address.
#[derive(Debug, Clone)]
pub struct TcpSocketProvider {
    /// `host:port` address of the daemon.
    pub addr: String,
}

impl TcpSocketProvider {
    /// Creates a provider for the daemon at `addr` (`host:port`).
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl ConnectionProvider for TcpSocketProvider {
    async fn provide(&self) -> Result<Connection> {
        debug!(addr = %self.addr, "dialing warden over tcp");
        let stream = TcpStream::connect(&self.addr).await?;
        Ok(Connection::new(stream))
    }
}
