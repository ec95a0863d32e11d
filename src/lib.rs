//! # warden-client
//!
//! **Async client for the warden container-host daemon control protocol**
//!
//! This crate speaks the framed protobuf protocol of a warden daemon over a
//! Unix-domain or TCP stream socket. It can create and destroy containers,
//! set memory/disk/file-descriptor limits, copy files in and out, query
//! container state, and spawn processes inside containers while streaming
//! their stdout, stderr and exit status back in real time.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         warden-client                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │  Client (pool)                                            │  │
//! │  │  single-slot rendezvous │ 1 s acquire → redial │ 5 s park │  │
//! │  └──────────────────────────┬────────────────────────────────┘  │
//! │                             │ acquire / release                 │
//! │  ┌──────────────────────────▼────────────────────────────────┐  │
//! │  │  Connection                                               │  │
//! │  │  write lock │ read lock │ disconnect signal │ streams     │  │
//! │  └──────────────────────────┬────────────────────────────────┘  │
//! │                             │ frames                            │
//! │  ┌──────────────────────────▼────────────────────────────────┐  │
//! │  │  Codec                                                    │  │
//! │  │  <len>\r\n<Message envelope>\r\n   (protobuf inside)      │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Transport: Unix-domain or TCP byte stream (ConnectionProvider) │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Connection Reuse
//!
//! All operations share one live connection. Round-trip operations borrow
//! it for exactly one request/response pair; streaming operations
//! ([`Client::run`], [`Client::attach`]) monopolize it until the process
//! exits, and the pool transparently dials a fresh connection for callers
//! that arrive in the meantime. A connection whose transport fails is
//! dropped, never reused; the failed call surfaces its error and the next
//! call reconnects.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use warden_client::{Client, ResourceLimits, UnixSocketProvider};
//!
//! #[tokio::main]
//! async fn main() -> warden_client::Result<()> {
//!     let provider = Arc::new(UnixSocketProvider::new("/tmp/warden.sock"));
//!     let client = Client::new(provider);
//!     client.connect().await?;
//!
//!     let created = client.create(&HashMap::new()).await?;
//!     let handle = created.handle.unwrap_or_default();
//!
//!     let (process_id, mut output) = client
//!         .run(&handle, "echo hello", ResourceLimits::default())
//!         .await?;
//!     println!("spawned process {process_id}");
//!
//!     while let Some(payload) = output.recv().await {
//!         if let Some(status) = payload.exit_status {
//!             println!("exited with {status}");
//!         } else if let Some(data) = payload.data {
//!             print!("{data}");
//!         }
//!     }
//!
//!     client.destroy(&handle).await?;
//!     Ok(())
//! }
//! ```

mod client;
mod connection;
mod error;
mod provider;

/// Framed envelope codec: `<decimal-len>\r\n<envelope>\r\n`.
///
/// Exposed so servers, fakes and tests can speak the wire format with the
/// same code the client uses.
pub mod codec;

/// Wire protocol messages: the envelope, the closed [`protocol::MessageType`]
/// set, and every request/response variant.
pub mod protocol;

pub use client::{
    Client, DiskLimits, ResourceLimits, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_PARK_TIMEOUT,
    DEFAULT_REDIAL_INTERVAL,
};
pub use connection::Connection;
pub use error::{Error, Result, WardenError};
pub use provider::{ConnectionProvider, TcpSocketProvider, UnixSocketProvider};
