//! Shared test support: an in-memory transport with byte-level capture and
//! scripted connection providers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use warden_client::{Connection, ConnectionProvider, Error, Result};

// =============================================================================
// Fake Transport
// =============================================================================

/// In-memory transport: reads come from a pre-seeded buffer (EOF once it is
/// exhausted), writes are captured for byte-exact assertions.
pub struct FakeTransport {
    seeded: io::Cursor<Vec<u8>>,
    written: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

/// Observer half of a [`FakeTransport`]: the captured writes and the
/// closed flag.
#[derive(Clone)]
pub struct FakeWire {
    written: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl FakeWire {
    /// Everything the client has written so far.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    /// Whether the client shut the transport down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl FakeTransport {
    pub fn new(seeded: Vec<u8>) -> (Self, FakeWire) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let wire = FakeWire {
            written: Arc::clone(&written),
            closed: Arc::clone(&closed),
        };
        (
            Self {
                seeded: io::Cursor::new(seeded),
                written,
                closed,
            },
            wire,
        )
    }
}

impl AsyncRead for FakeTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::other("transport closed")));
        }

        let pos = self.seeded.position() as usize;
        let remaining = &self.seeded.get_ref()[pos..];
        if remaining.is_empty() {
            // EOF once the scripted responses run out.
            return Poll::Ready(Ok(()));
        }

        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        self.seeded.set_position((pos + n) as u64);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for FakeTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::other("transport closed")));
        }
        self.written.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.closed.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// A connection over a fresh fake transport seeded with `responses`.
pub fn fake_connection(responses: Vec<u8>) -> (Connection, FakeWire) {
    let (transport, wire) = FakeTransport::new(responses);
    (Connection::new(transport), wire)
}

// =============================================================================
// Scripted Providers
// =============================================================================

/// Provider whose every dial fails.
pub struct FailingProvider;

#[async_trait]
impl ConnectionProvider for FailingProvider {
    async fn provide(&self) -> Result<Connection> {
        Err(Error::Io(io::Error::other("nope!")))
    }
}

/// Provider that hands out pre-built connections in order, then fails.
pub struct SequenceProvider {
    connections: Mutex<VecDeque<Connection>>,
}

impl SequenceProvider {
    pub fn new(connections: Vec<Connection>) -> Self {
        Self {
            connections: Mutex::new(connections.into()),
        }
    }
}

#[async_trait]
impl ConnectionProvider for SequenceProvider {
    async fn provide(&self) -> Result<Connection> {
        self.connections
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Io(io::Error::other("no more connections")))
    }
}
