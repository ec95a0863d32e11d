//! A single live connection to the warden daemon.
//!
//! # Concurrency Contract
//!
//! One write at a time and one read at a time, each guarded by its own
//! mutex; a write may proceed concurrently with a read. A round-trip is one
//! request write followed by one response read, so round-trips on a shared
//! connection are strictly sequential (no pipelining). The streaming
//! operations ([`Connection::run`], [`Connection::attach`],
//! [`Connection::stream`]) hand the read half to a background task that
//! holds the read lock until the stream terminates.
//!
//! # Lifecycle
//!
//! ```text
//! Open ──(first I/O failure on either half)──► Broken ──close()──► Closed
//! ```
//!
//! The disconnect signal fires exactly once, on the first read or write
//! failure; `Broken` is absorbing and [`Connection::close`] is idempotent.
//! Callers are expected to discard a connection once the signal has fired.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::codec;
use crate::error::Result;
use crate::protocol::{
    AttachRequest, CopyInRequest, CopyInResponse, CopyOutRequest, CopyOutResponse, CreateRequest,
    CreateResponse, DestroyRequest, DestroyResponse, EchoRequest, EchoResponse, InfoRequest,
    InfoResponse, LimitDiskRequest, LimitDiskResponse, LimitMemoryRequest, LimitMemoryResponse,
    LinkRequest, LinkResponse, ListRequest, ListResponse, NetInRequest, NetInResponse,
    ProcessPayload, ResourceLimits, RunRequest, SpawnRequest, SpawnResponse, StopRequest,
    StopResponse, StreamRequest, StreamResponse, WireMessage,
};

type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Buffer depth for streaming output channels.
///
/// Frames are forwarded one at a time; the depth only smooths the hand-off
/// between the reader task and the consumer.
const STREAM_CHANNEL_SIZE: usize = 1;

/// One bidirectional byte stream to the server plus its codec state and
/// disconnect signal.
///
/// Cloning is cheap and clones share the underlying transport; the locks
/// make shared use safe, but callers who want request/response ordering
/// must serialize access themselves (the pool in [`crate::Client`] does).
#[derive(Clone)]
pub struct Connection {
    writer: Arc<Mutex<BoxedWriter>>,
    reader: Arc<Mutex<BoxedReader>>,
    disconnected: watch::Sender<bool>,
}

impl Connection {
    /// Wraps a connected transport.
    ///
    /// The transport is split into a buffered read half and a write half;
    /// the connection uses the single stream for both directions.
    #[must_use]
    pub fn new<T>(transport: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);

        let (disconnected, _) = watch::channel(false);

        Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(BufReader::new(reader))),
            disconnected,
        }
    }

    /// Shuts down the write half of the transport.
    ///
    /// Idempotent; errors from an already-closed transport are ignored.
    pub async fn close(&self) {
        use tokio::io::AsyncWriteExt;

        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Returns a watcher for the disconnect signal.
    ///
    /// The signal latches: once it has fired, every present and future
    /// watcher observes it. Wait with
    /// `watcher.wait_for(|broken| *broken)`.
    #[must_use]
    pub fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected.subscribe()
    }

    /// Publishes the disconnect signal. First caller wins; later calls are
    /// no-ops because the value is already `true`.
    fn publish_disconnect(&self) {
        if !*self.disconnected.borrow() {
            debug!("warden connection broken");
        }
        self.disconnected.send_replace(true);
    }

    // =========================================================================
    // Framing
    // =========================================================================

    /// Writes one request under the write lock.
    ///
    /// A transport failure publishes the disconnect signal before the error
    /// is returned.
    pub async fn send_message<M: WireMessage>(&self, msg: &M) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match codec::write_message(&mut *writer, msg).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if err.is_transport() {
                    self.publish_disconnect();
                }
                Err(err)
            }
        }
    }

    /// Reads one response of the expected type under the read lock.
    pub async fn read_response<M: WireMessage>(&self) -> Result<M> {
        let mut reader = self.reader.lock().await;
        self.read_response_locked(&mut reader).await
    }

    async fn read_response_locked<M: WireMessage>(&self, reader: &mut BoxedReader) -> Result<M> {
        let envelope = match codec::read_frame(reader).await {
            Ok(envelope) => envelope,
            Err(err) => {
                if err.is_transport() {
                    self.publish_disconnect();
                }
                return Err(err);
            }
        };
        codec::decode_response(&envelope)
    }

    /// One request write paired with one response read.
    pub async fn round_trip<Req, Resp>(&self, request: &Req) -> Result<Resp>
    where
        Req: WireMessage,
        Resp: WireMessage,
    {
        self.send_message(request).await?;
        self.read_response().await
    }

    // =========================================================================
    // Lifecycle Operations
    // =========================================================================

    /// Creates a container tagged with `properties` and returns the
    /// server-assigned handle.
    pub async fn create(
        &self,
        properties: &std::collections::HashMap<String, String>,
    ) -> Result<CreateResponse> {
        self.round_trip(&CreateRequest {
            properties: crate::protocol::properties_from(properties),
        })
        .await
    }

    /// Stops all processes in a container.
    pub async fn stop(&self, handle: &str, background: bool, kill: bool) -> Result<StopResponse> {
        self.round_trip(&StopRequest {
            handle: Some(handle.to_string()),
            background: Some(background),
            kill: Some(kill),
        })
        .await
    }

    /// Destroys a container.
    pub async fn destroy(&self, handle: &str) -> Result<DestroyResponse> {
        self.round_trip(&DestroyRequest {
            handle: Some(handle.to_string()),
        })
        .await
    }

    // =========================================================================
    // Process Operations
    // =========================================================================

    /// Spawns `script` inside the container and streams its output.
    ///
    /// Returns the process id from the initial response frame and a channel
    /// of subsequent [`ProcessPayload`] frames. The channel closes after the
    /// frame carrying `exit_status`, or early if the transport fails; early
    /// closure without an exit status is how callers detect truncation.
    ///
    /// The read half stays dedicated to this stream until it terminates.
    pub async fn run(
        &self,
        handle: &str,
        script: &str,
        rlimits: ResourceLimits,
    ) -> Result<(u32, mpsc::Receiver<ProcessPayload>)> {
        self.send_message(&RunRequest {
            handle: Some(handle.to_string()),
            script: Some(script.to_string()),
            rlimits: Some(rlimits),
        })
        .await?;

        let mut reader = Arc::clone(&self.reader).lock_owned().await;
        let first: ProcessPayload = self.read_response_locked(&mut reader).await?;
        let process_id = first.process_id.unwrap_or_default();

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        let conn = self.clone();
        tokio::spawn(async move {
            conn.forward_payloads(reader, tx).await;
        });

        Ok((process_id, rx))
    }

    /// Re-attaches to a live process and streams its remaining output.
    ///
    /// Identical to [`Connection::run`] except there is no initial
    /// process-id frame.
    pub async fn attach(
        &self,
        handle: &str,
        process_id: u32,
    ) -> Result<mpsc::Receiver<ProcessPayload>> {
        self.send_message(&AttachRequest {
            handle: Some(handle.to_string()),
            process_id: Some(process_id),
        })
        .await?;

        let reader = Arc::clone(&self.reader).lock_owned().await;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        let conn = self.clone();
        tokio::spawn(async move {
            conn.forward_payloads(reader, tx).await;
        });

        Ok(rx)
    }

    /// Legacy: streams output from a job started with [`Connection::spawn`].
    ///
    /// Returns the frame channel plus a `done` receiver that yields once
    /// the stream has ended (terminal frame or transport failure).
    pub async fn stream(
        &self,
        handle: &str,
        job_id: u32,
    ) -> Result<(mpsc::Receiver<StreamResponse>, oneshot::Receiver<()>)> {
        self.send_message(&StreamRequest {
            handle: Some(handle.to_string()),
            job_id: Some(job_id),
        })
        .await?;

        let mut reader = Arc::clone(&self.reader).lock_owned().await;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        let (done_tx, done_rx) = oneshot::channel();
        let conn = self.clone();

        tokio::spawn(async move {
            loop {
                let frame: StreamResponse = match conn.read_response_locked(&mut reader).await {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                let terminal = frame.exit_status.is_some();
                if tx.send(frame).await.is_err() {
                    break;
                }
                if terminal {
                    break;
                }
            }
            let _ = done_tx.send(());
        });

        Ok((rx, done_rx))
    }

    /// Legacy: spawns a script, returning a job id for
    /// [`Connection::link`] or [`Connection::stream`].
    pub async fn spawn(
        &self,
        handle: &str,
        script: &str,
        discard_output: bool,
    ) -> Result<SpawnResponse> {
        self.round_trip(&SpawnRequest {
            handle: Some(handle.to_string()),
            script: Some(script.to_string()),
            discard_output: Some(discard_output),
        })
        .await
    }

    /// Legacy: waits for a spawned job and collects its buffered output.
    pub async fn link(&self, handle: &str, job_id: u32) -> Result<LinkResponse> {
        self.round_trip(&LinkRequest {
            handle: Some(handle.to_string()),
            job_id: Some(job_id),
        })
        .await
    }

    /// Reader loop shared by `run` and `attach`. Holds the read lock for
    /// the whole stream; the channel closing is the end-of-stream signal.
    async fn forward_payloads(
        &self,
        mut reader: OwnedMutexGuard<BoxedReader>,
        tx: mpsc::Sender<ProcessPayload>,
    ) {
        loop {
            let payload: ProcessPayload = match self.read_response_locked(&mut reader).await {
                Ok(payload) => payload,
                Err(_) => break,
            };
            let terminal = payload.exit_status.is_some();
            if tx.send(payload).await.is_err() {
                // Consumer went away; stop reading rather than buffer
                // unbounded output nobody will see.
                break;
            }
            if terminal {
                break;
            }
        }
    }

    // =========================================================================
    // Network Operations
    // =========================================================================

    /// Maps a server-chosen host port into the container.
    pub async fn net_in(&self, handle: &str) -> Result<NetInResponse> {
        self.round_trip(&NetInRequest {
            handle: Some(handle.to_string()),
        })
        .await
    }

    // =========================================================================
    // Limit Operations
    // =========================================================================

    /// Sets the container's memory limit in bytes.
    pub async fn limit_memory(&self, handle: &str, limit: u64) -> Result<LimitMemoryResponse> {
        self.round_trip(&LimitMemoryRequest {
            handle: Some(handle.to_string()),
            limit_in_bytes: Some(limit),
        })
        .await
    }

    /// Queries the current memory limit.
    ///
    /// The server reports `i64::MAX` when the container is unlimited; that
    /// sentinel is translated to 0.
    pub async fn get_memory_limit(&self, handle: &str) -> Result<u64> {
        let response: LimitMemoryResponse = self
            .round_trip(&LimitMemoryRequest {
                handle: Some(handle.to_string()),
                limit_in_bytes: None,
            })
            .await?;

        let limit = response.limit_in_bytes.unwrap_or_default();
        if limit == i64::MAX as u64 {
            // Probably not a limit.
            return Ok(0);
        }
        Ok(limit)
    }

    /// Sets the container's disk quota. The caller builds the request so
    /// that unset fields stay off the wire.
    pub async fn limit_disk(&self, request: &LimitDiskRequest) -> Result<LimitDiskResponse> {
        self.round_trip(request).await
    }

    /// Queries the current disk byte limit, verbatim.
    pub async fn get_disk_limit(&self, handle: &str) -> Result<u64> {
        let response: LimitDiskResponse = self
            .round_trip(&LimitDiskRequest {
                handle: Some(handle.to_string()),
                byte_limit: None,
                inode_limit: None,
            })
            .await?;

        Ok(response.byte_limit.unwrap_or_default())
    }

    // =========================================================================
    // File Operations
    // =========================================================================

    /// Copies a host path into the container.
    pub async fn copy_in(&self, handle: &str, src: &str, dst: &str) -> Result<CopyInResponse> {
        self.round_trip(&CopyInRequest {
            handle: Some(handle.to_string()),
            src_path: Some(src.to_string()),
            dst_path: Some(dst.to_string()),
        })
        .await
    }

    /// Copies a container path out to the host, chowned to `owner`.
    pub async fn copy_out(
        &self,
        handle: &str,
        src: &str,
        dst: &str,
        owner: &str,
    ) -> Result<CopyOutResponse> {
        self.round_trip(&CopyOutRequest {
            handle: Some(handle.to_string()),
            src_path: Some(src.to_string()),
            dst_path: Some(dst.to_string()),
            owner: Some(owner.to_string()),
        })
        .await
    }

    // =========================================================================
    // Query Operations
    // =========================================================================

    /// Lists container handles matching the filter properties.
    pub async fn list(
        &self,
        filter_properties: &std::collections::HashMap<String, String>,
    ) -> Result<ListResponse> {
        self.round_trip(&ListRequest {
            properties: crate::protocol::properties_from(filter_properties),
        })
        .await
    }

    /// Fetches state and addressing details for one container.
    pub async fn info(&self, handle: &str) -> Result<InfoResponse> {
        self.round_trip(&InfoRequest {
            handle: Some(handle.to_string()),
        })
        .await
    }

    /// Round-trips a message through the server.
    pub async fn echo(&self, message: &str) -> Result<EchoResponse> {
        self.round_trip(&EchoRequest {
            message: Some(message.to_string()),
        })
        .await
    }
}
