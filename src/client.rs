//! Pooling warden client.
//!
//! The client owns a [`ConnectionProvider`] and a single-slot rendezvous
//! through which the one live [`Connection`] circulates:
//!
//! ```text
//!            ┌──────────────── release ────────────────┐
//!            ▼                                         │
//!      ┌──────────┐   hand-off   ┌─────────┐   op   ┌──┴───┐
//!      │  parker  │ ───────────► │ acquire │ ─────► │caller│
//!      │  (task)  │              └─────────┘        └──────┘
//!      └──────────┘
//!       │        │
//!       │        └─ 5 s with no caller → close connection
//!       └─ disconnect signal → drop connection
//! ```
//!
//! A connection is always in exactly one of three places: held by one
//! caller, parked on its parker task awaiting the next caller, or discarded
//! because its disconnect signal fired. Nothing is ever buffered in the
//! slot itself, so a broken connection can never be handed out stale.
//!
//! Non-streaming operations release their connection as soon as the
//! round-trip finishes. Streaming operations ([`Client::run`],
//! [`Client::attach`], [`Client::stream`]) monopolize the connection's read
//! half, so ownership transfers to a forwarder task that releases the
//! connection only after the stream ends.
//!
//! A call that fails in flight is never retried; the failed connection is
//! simply not re-parked, and the next acquire times out on the empty slot
//! and dials a fresh connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::{
    self, CopyInResponse, CopyOutResponse, CreateResponse, DestroyResponse, EchoResponse,
    InfoResponse, LimitDiskRequest, LimitDiskResponse, LimitMemoryResponse, LinkResponse,
    ListResponse, NetInResponse, ProcessPayload, SpawnResponse, StopResponse, StreamResponse,
};
use crate::provider::ConnectionProvider;

// =============================================================================
// Constants
// =============================================================================

/// How long an acquire waits on the slot before dialing fresh.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a parked connection waits for a caller before being closed.
pub const DEFAULT_PARK_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between provider retries when dialing fresh.
pub const DEFAULT_REDIAL_INTERVAL: Duration = Duration::from_millis(500);

type Waiter = oneshot::Sender<Connection>;

// =============================================================================
// Resource Limit Inputs
// =============================================================================

/// Per-process resource limits for [`Client::run`].
///
/// Zero means "don't send the field"; the server then applies its default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum number of open file descriptors.
    pub file_descriptors: u64,
}

/// Disk quota inputs for [`Client::limit_disk`].
///
/// Zero means "don't send the field".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskLimits {
    /// Quota in bytes.
    pub byte_limit: u64,
    /// Quota in inodes.
    pub inode_limit: u64,
}

// =============================================================================
// Client
// =============================================================================

/// Handle to the warden daemon: dials through its provider, serializes
/// calls onto the one live connection, and reconnects for future calls
/// when that connection breaks.
///
/// Cloning shares the pool; clones contend on the same slot.
#[derive(Clone)]
pub struct Client {
    provider: Arc<dyn ConnectionProvider>,
    waiters: mpsc::UnboundedSender<Waiter>,
    waiter_queue: Arc<Mutex<mpsc::UnboundedReceiver<Waiter>>>,
    acquire_timeout: Duration,
    park_timeout: Duration,
    redial_interval: Duration,
}

impl Client {
    /// Creates a client over `provider`. No connection is dialed until
    /// [`Client::connect`] or the first operation.
    #[must_use]
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        let (waiters, waiter_queue) = mpsc::unbounded_channel();
        Self {
            provider,
            waiters,
            waiter_queue: Arc::new(Mutex::new(waiter_queue)),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            park_timeout: DEFAULT_PARK_TIMEOUT,
            redial_interval: DEFAULT_REDIAL_INTERVAL,
        }
    }

    /// Sets how long an acquire waits on the slot before dialing fresh.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets how long a parked connection survives without a caller.
    #[must_use]
    pub fn with_park_timeout(mut self, timeout: Duration) -> Self {
        self.park_timeout = timeout;
        self
    }

    /// Sets the delay between provider retries when dialing fresh.
    #[must_use]
    pub fn with_redial_interval(mut self, interval: Duration) -> Self {
        self.redial_interval = interval;
        self
    }

    /// Dials an initial connection and parks it for the first caller.
    ///
    /// # Errors
    ///
    /// Returns the provider's error verbatim if the dial fails; nothing is
    /// parked in that case. This is the only place a provider failure
    /// surfaces; later redials retry until they succeed.
    pub async fn connect(&self) -> Result<()> {
        let conn = self.provider.provide().await?;
        self.release(conn);
        Ok(())
    }

    // =========================================================================
    // Pool Plumbing
    // =========================================================================

    /// Returns a connection to the pool by spawning a fresh parker for it.
    /// Fire-and-forget; this is the only path back into the slot.
    fn release(&self, conn: Connection) {
        let queue = Arc::clone(&self.waiter_queue);
        let park_timeout = self.park_timeout;
        tokio::spawn(Self::serve_connection(queue, conn, park_timeout));
    }

    /// Parks `conn` until a caller accepts it, its disconnect signal fires,
    /// or it sits idle for the park timeout.
    ///
    /// The select is biased with the disconnect branch first so a broken
    /// connection is dropped even when a waiter is already queued.
    async fn serve_connection(
        queue: Arc<Mutex<mpsc::UnboundedReceiver<Waiter>>>,
        mut conn: Connection,
        park_timeout: Duration,
    ) {
        let mut disconnected = conn.disconnected();
        let idle = tokio::time::sleep(park_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                biased;

                _ = async {
                    loop {
                        if *disconnected.borrow() {
                            return;
                        }
                        if disconnected.changed().await.is_err() {
                            return;
                        }
                    }
                } => {
                    debug!("dropping broken connection from pool");
                    return;
                }

                waiter = async { queue.lock().await.recv().await } => {
                    let Some(reply) = waiter else {
                        // Client dropped; nobody will ever acquire again.
                        conn.close().await;
                        return;
                    };
                    match reply.send(conn) {
                        // Ownership transferred to the caller.
                        Ok(()) => return,
                        // The waiter timed out and went away; park again.
                        Err(returned) => conn = returned,
                    }
                }

                _ = &mut idle => {
                    debug!("closing idle connection");
                    conn.close().await;
                    return;
                }
            }
        }
    }

    /// Takes the live connection from the slot, or dials fresh after the
    /// acquire timeout.
    async fn acquire_connection(&self) -> Connection {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.waiters.send(reply_tx).is_ok() {
            if let Ok(Ok(conn)) = timeout(self.acquire_timeout, reply_rx).await {
                return conn;
            }
        }
        self.dial().await
    }

    /// Dials through the provider until it succeeds. Never returns an
    /// error; failures are logged and retried at the redial interval.
    async fn dial(&self) -> Connection {
        loop {
            match self.provider.provide().await {
                Ok(conn) => return conn,
                Err(err) => {
                    warn!(error = %err, "failed to dial warden, retrying");
                    tokio::time::sleep(self.redial_interval).await;
                }
            }
        }
    }

    /// Proxies a stream to the caller, releasing `conn` only once the
    /// underlying channel closes. If the caller drops the proxy receiver
    /// early the forwarder keeps draining, so the connection still comes
    /// back only when its read half is actually free again.
    fn proxy_stream<T: Send + 'static>(
        &self,
        conn: Connection,
        mut stream: mpsc::Receiver<T>,
    ) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(1);
        let pool = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.recv().await {
                let _ = tx.send(frame).await;
            }
            pool.release(conn);
        });
        rx
    }

    // =========================================================================
    // Lifecycle Operations
    // =========================================================================

    /// Creates a container and returns the server-assigned handle.
    pub async fn create(&self, properties: &HashMap<String, String>) -> Result<CreateResponse> {
        let conn = self.acquire_connection().await;
        let result = conn.create(properties).await;
        self.release(conn);
        result
    }

    /// Stops all processes in a container.
    pub async fn stop(&self, handle: &str, background: bool, kill: bool) -> Result<StopResponse> {
        let conn = self.acquire_connection().await;
        let result = conn.stop(handle, background, kill).await;
        self.release(conn);
        result
    }

    /// Destroys a container.
    pub async fn destroy(&self, handle: &str) -> Result<DestroyResponse> {
        let conn = self.acquire_connection().await;
        let result = conn.destroy(handle).await;
        self.release(conn);
        result
    }

    // =========================================================================
    // Process Operations
    // =========================================================================

    /// Spawns `script` in the container, streaming its output.
    ///
    /// The connection stays out of the pool for the lifetime of the stream;
    /// concurrent calls get a different (possibly freshly dialed)
    /// connection.
    pub async fn run(
        &self,
        handle: &str,
        script: &str,
        limits: ResourceLimits,
    ) -> Result<(u32, mpsc::Receiver<ProcessPayload>)> {
        let conn = self.acquire_connection().await;

        let mut rlimits = protocol::ResourceLimits::default();
        if limits.file_descriptors > 0 {
            rlimits.nofile = Some(limits.file_descriptors);
        }

        match conn.run(handle, script, rlimits).await {
            Ok((process_id, stream)) => Ok((process_id, self.proxy_stream(conn, stream))),
            Err(err) => {
                self.release(conn);
                Err(err)
            }
        }
    }

    /// Re-attaches to a live process and streams its remaining output.
    pub async fn attach(
        &self,
        handle: &str,
        process_id: u32,
    ) -> Result<mpsc::Receiver<ProcessPayload>> {
        let conn = self.acquire_connection().await;
        match conn.attach(handle, process_id).await {
            Ok(stream) => Ok(self.proxy_stream(conn, stream)),
            Err(err) => {
                self.release(conn);
                Err(err)
            }
        }
    }

    /// Legacy: spawns a script for [`Client::link`] / [`Client::stream`].
    pub async fn spawn(
        &self,
        handle: &str,
        script: &str,
        discard_output: bool,
    ) -> Result<SpawnResponse> {
        let conn = self.acquire_connection().await;
        let result = conn.spawn(handle, script, discard_output).await;
        self.release(conn);
        result
    }

    /// Legacy: waits for a spawned job and collects its buffered output.
    pub async fn link(&self, handle: &str, job_id: u32) -> Result<LinkResponse> {
        let conn = self.acquire_connection().await;
        let result = conn.link(handle, job_id).await;
        self.release(conn);
        result
    }

    /// Legacy: streams output from a spawned job. The `done` receiver
    /// yields once the stream has ended.
    pub async fn stream(
        &self,
        handle: &str,
        job_id: u32,
    ) -> Result<(mpsc::Receiver<StreamResponse>, oneshot::Receiver<()>)> {
        let conn = self.acquire_connection().await;
        let (stream, _stream_done) = match conn.stream(handle, job_id).await {
            Ok(parts) => parts,
            Err(err) => {
                self.release(conn);
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::channel(1);
        let (done_tx, done_rx) = oneshot::channel();
        let pool = self.clone();
        let mut stream = stream;
        tokio::spawn(async move {
            while let Some(frame) = stream.recv().await {
                let _ = tx.send(frame).await;
            }
            let _ = done_tx.send(());
            pool.release(conn);
        });

        Ok((rx, done_rx))
    }

    // =========================================================================
    // Network Operations
    // =========================================================================

    /// Maps a server-chosen host port into the container.
    pub async fn net_in(&self, handle: &str) -> Result<NetInResponse> {
        let conn = self.acquire_connection().await;
        let result = conn.net_in(handle).await;
        self.release(conn);
        result
    }

    // =========================================================================
    // Limit Operations
    // =========================================================================

    /// Sets the container's memory limit in bytes.
    pub async fn limit_memory(&self, handle: &str, limit: u64) -> Result<LimitMemoryResponse> {
        let conn = self.acquire_connection().await;
        let result = conn.limit_memory(handle, limit).await;
        self.release(conn);
        result
    }

    /// Queries the current memory limit; 0 means unlimited.
    pub async fn get_memory_limit(&self, handle: &str) -> Result<u64> {
        let conn = self.acquire_connection().await;
        let result = conn.get_memory_limit(handle).await;
        self.release(conn);
        result
    }

    /// Sets the container's disk quota. Zero fields are left off the wire.
    pub async fn limit_disk(&self, handle: &str, limits: DiskLimits) -> Result<LimitDiskResponse> {
        let conn = self.acquire_connection().await;

        let mut request = LimitDiskRequest {
            handle: Some(handle.to_string()),
            byte_limit: None,
            inode_limit: None,
        };
        if limits.byte_limit > 0 {
            request.byte_limit = Some(limits.byte_limit);
        }
        if limits.inode_limit > 0 {
            request.inode_limit = Some(limits.inode_limit);
        }

        let result = conn.limit_disk(&request).await;
        self.release(conn);
        result
    }

    /// Queries the current disk byte limit, verbatim.
    pub async fn get_disk_limit(&self, handle: &str) -> Result<u64> {
        let conn = self.acquire_connection().await;
        let result = conn.get_disk_limit(handle).await;
        self.release(conn);
        result
    }

    // =========================================================================
    // File Operations
    // =========================================================================

    /// Copies a host path into the container.
    pub async fn copy_in(&self, handle: &str, src: &str, dst: &str) -> Result<CopyInResponse> {
        let conn = self.acquire_connection().await;
        let result = conn.copy_in(handle, src, dst).await;
        self.release(conn);
        result
    }

    /// Copies a container path out to the host, chowned to `owner`.
    pub async fn copy_out(
        &self,
        handle: &str,
        src: &str,
        dst: &str,
        owner: &str,
    ) -> Result<CopyOutResponse> {
        let conn = self.acquire_connection().await;
        let result = conn.copy_out(handle, src, dst, owner).await;
        self.release(conn);
        result
    }

    // =========================================================================
    // Query Operations
    // =========================================================================

    /// Lists container handles matching the filter properties.
    pub async fn list(&self, filter_properties: &HashMap<String, String>) -> Result<ListResponse> {
        let conn = self.acquire_connection().await;
        let result = conn.list(filter_properties).await;
        self.release(conn);
        result
    }

    /// Fetches state and addressing details for one container.
    pub async fn info(&self, handle: &str) -> Result<InfoResponse> {
        let conn = self.acquire_connection().await;
        let result = conn.info(handle).await;
        self.release(conn);
        result
    }

    /// Round-trips a message through the server.
    pub async fn echo(&self, message: &str) -> Result<EchoResponse> {
        let conn = self.acquire_connection().await;
        let result = conn.echo(message).await;
        self.release(conn);
        result
    }
}
