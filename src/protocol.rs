//! Warden wire protocol definitions.
//!
//! This module defines the protobuf messages exchanged with the warden
//! daemon and the envelope that carries them.
//!
//! # Protocol Format
//!
//! - **Transport**: byte stream (Unix-domain or TCP socket)
//! - **Encoding**: protobuf, wrapped in a typed [`Message`] envelope
//! - **Framing**: ASCII decimal payload length, CRLF, payload, CRLF
//!
//! ```text
//! Client                            Warden
//!   |                                 |
//!   |  23\r\n<Message bytes>\r\n      |
//!   |-------------------------------->|
//!   |                                 |
//!   |  17\r\n<Message bytes>\r\n      |
//!   |<--------------------------------|
//!   |                                 |
//! ```
//!
//! The envelope pairs a [`MessageType`] tag with the serialized inner
//! message. Every request and response variant implements [`WireMessage`],
//! which fixes its tag; the codec uses the tag to verify that a response is
//! of the expected variant and to recognize [`ErrorResponse`] envelopes.
//!
//! The message structs here are written by hand against the daemon's schema
//! rather than generated. The schema is proto2-era: optional scalar fields
//! map to `Option<T>`.

// =============================================================================
// Envelope
// =============================================================================

/// Closed set of envelope tags, one per request/response variant.
///
/// Paired request and response variants share a tag (e.g. `CreateRequest`
/// and `CreateResponse` are both [`MessageType::Create`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    /// Server-originated fault, payload is [`ErrorResponse`].
    Error = 1,

    // Container lifecycle.
    Create = 11,
    Stop = 12,
    Destroy = 13,
    Info = 14,

    // Process operations. Spawn/Link/Stream are the legacy generation,
    // Run/Attach the current one; servers may reject whichever they
    // don't know.
    Spawn = 21,
    Link = 22,
    Run = 23,
    Stream = 24,

    // Network configuration.
    NetIn = 31,

    // File transfer.
    CopyIn = 41,
    CopyOut = 42,

    // Resource limits.
    LimitMemory = 51,
    LimitDisk = 52,

    // Queries.
    List = 92,
    Echo = 93,
    Attach = 94,

    /// Streaming frame from a running process.
    ProcessPayload = 95,
}

/// The on-wire envelope: a type tag plus the serialized inner message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    /// Tag identifying the payload variant.
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    /// Serialized inner protobuf of the type named by the tag.
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

/// A protocol message with a fixed envelope tag.
///
/// Implemented by every request and response variant; the codec relies on
/// [`WireMessage::TYPE`] both when wrapping outgoing messages and when
/// verifying incoming ones.
pub trait WireMessage: prost::Message + Default {
    /// Envelope tag for this variant.
    const TYPE: MessageType;

    /// Wraps the serialized form of `self` in a [`Message`] envelope.
    fn to_envelope(&self) -> Message {
        Message {
            r#type: Self::TYPE as i32,
            payload: self.encode_to_vec(),
        }
    }
}

macro_rules! wire_message {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl WireMessage for $ty {
                const TYPE: MessageType = MessageType::$tag;
            }
        )*
    };
}

// =============================================================================
// Shared Types
// =============================================================================

/// A key/value property attached to a container at create time or used as
/// a list filter.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Property {
    #[prost(string, optional, tag = "1")]
    pub key: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub value: Option<String>,
}

/// Per-process resource limits carried on a [`RunRequest`].
///
/// Only `nofile` is populated by this client; the remaining rlimit slots in
/// the schema are left to their defaults.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ResourceLimits {
    /// Maximum number of open file descriptors.
    #[prost(uint64, optional, tag = "10")]
    pub nofile: Option<u64>,
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Create a container. The server assigns and returns the handle.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateRequest {
    #[prost(message, repeated, tag = "1")]
    pub properties: Vec<Property>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateResponse {
    /// Opaque name for the new container.
    #[prost(string, optional, tag = "1")]
    pub handle: Option<String>,
}

/// Stop all processes in a container.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StopRequest {
    #[prost(string, optional, tag = "1")]
    pub handle: Option<String>,
    /// Return before the stop has completed.
    #[prost(bool, optional, tag = "2")]
    pub background: Option<bool>,
    /// Escalate to SIGKILL.
    #[prost(bool, optional, tag = "3")]
    pub kill: Option<bool>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StopResponse {}

/// Destroy a container and release its resources.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DestroyRequest {
    #[prost(string, optional, tag = "1")]
    pub handle: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DestroyResponse {}

// =============================================================================
// Process
// =============================================================================

/// Spawn a script and stream its output.
///
/// The first response frame carries only the process id; subsequent
/// [`ProcessPayload`] frames carry output and finally the exit status.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RunRequest {
    #[prost(string, optional, tag = "1")]
    pub handle: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub script: Option<String>,
    #[prost(message, optional, tag = "3")]
    pub rlimits: Option<ResourceLimits>,
}

/// Re-attach to the output stream of a live process.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AttachRequest {
    #[prost(string, optional, tag = "1")]
    pub handle: Option<String>,
    #[prost(uint32, optional, tag = "2")]
    pub process_id: Option<u32>,
}

/// One streaming frame from a running process.
///
/// A frame without `exit_status` means more frames may follow; a frame with
/// `exit_status` set is terminal for that process.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProcessPayload {
    #[prost(uint32, optional, tag = "1")]
    pub process_id: Option<u32>,
    #[prost(enumeration = "ProcessSource", optional, tag = "2")]
    pub source: Option<i32>,
    #[prost(string, optional, tag = "3")]
    pub data: Option<String>,
    #[prost(uint32, optional, tag = "4")]
    pub exit_status: Option<u32>,
}

impl ProcessPayload {
    /// Returns which stdio stream this frame belongs to, if any.
    pub fn stream_source(&self) -> Option<ProcessSource> {
        self.source.and_then(|raw| ProcessSource::try_from(raw).ok())
    }
}

/// Stdio stream a [`ProcessPayload`] frame originates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum ProcessSource {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

/// Legacy: spawn a script, returning a job id for [`LinkRequest`] or
/// [`StreamRequest`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct SpawnRequest {
    #[prost(string, optional, tag = "1")]
    pub handle: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub script: Option<String>,
    /// Drop output instead of buffering it for a later Link.
    #[prost(bool, optional, tag = "3")]
    pub discard_output: Option<bool>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SpawnResponse {
    #[prost(uint32, optional, tag = "1")]
    pub job_id: Option<u32>,
}

/// Legacy: block until a spawned job exits and collect its output.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LinkRequest {
    #[prost(string, optional, tag = "1")]
    pub handle: Option<String>,
    #[prost(uint32, optional, tag = "2")]
    pub job_id: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LinkResponse {
    #[prost(string, optional, tag = "1")]
    pub stdout: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub stderr: Option<String>,
    #[prost(uint32, optional, tag = "3")]
    pub exit_status: Option<u32>,
}

/// Legacy: stream output from a spawned job.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamRequest {
    #[prost(string, optional, tag = "1")]
    pub handle: Option<String>,
    #[prost(uint32, optional, tag = "2")]
    pub job_id: Option<u32>,
}

/// Legacy streaming frame; terminal when `exit_status` is set.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamResponse {
    /// Stream name, `"stdout"` or `"stderr"`.
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub data: Option<String>,
    #[prost(uint32, optional, tag = "3")]
    pub exit_status: Option<u32>,
}

// =============================================================================
// Network
// =============================================================================

/// Map a host port into the container. The server picks both ports.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NetInRequest {
    #[prost(string, optional, tag = "1")]
    pub handle: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NetInResponse {
    #[prost(uint32, optional, tag = "1")]
    pub host_port: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub container_port: Option<u32>,
}

// =============================================================================
// Resource Limits
// =============================================================================

/// Set (limit present) or query (limit absent) the memory limit.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LimitMemoryRequest {
    #[prost(string, optional, tag = "1")]
    pub handle: Option<String>,
    #[prost(uint64, optional, tag = "2")]
    pub limit_in_bytes: Option<u64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LimitMemoryResponse {
    /// Current limit. The server reports `i64::MAX` when unlimited.
    #[prost(uint64, optional, tag = "1")]
    pub limit_in_bytes: Option<u64>,
}

/// Set (limits present) or query (limits absent) the disk quota.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LimitDiskRequest {
    #[prost(string, optional, tag = "1")]
    pub handle: Option<String>,
    #[prost(uint64, optional, tag = "2")]
    pub byte_limit: Option<u64>,
    #[prost(uint64, optional, tag = "3")]
    pub inode_limit: Option<u64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LimitDiskResponse {
    #[prost(uint64, optional, tag = "2")]
    pub byte_limit: Option<u64>,
    #[prost(uint64, optional, tag = "3")]
    pub inode_limit: Option<u64>,
}

// =============================================================================
// Files
// =============================================================================

/// Copy a file or directory from the host into the container.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CopyInRequest {
    #[prost(string, optional, tag = "1")]
    pub handle: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub src_path: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub dst_path: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CopyInResponse {}

/// Copy a file or directory out of the container, chowned to `owner`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CopyOutRequest {
    #[prost(string, optional, tag = "1")]
    pub handle: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub src_path: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub dst_path: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub owner: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CopyOutResponse {}

// =============================================================================
// Queries
// =============================================================================

/// List container handles, optionally filtered by properties.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ListRequest {
    #[prost(message, repeated, tag = "1")]
    pub properties: Vec<Property>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListResponse {
    #[prost(string, repeated, tag = "1")]
    pub handles: Vec<String>,
}

/// Inspect one container.
#[derive(Clone, PartialEq, prost::Message)]
pub struct InfoRequest {
    #[prost(string, optional, tag = "1")]
    pub handle: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InfoResponse {
    /// Lifecycle state as reported by the server (e.g. `"active"`).
    #[prost(string, optional, tag = "1")]
    pub state: Option<String>,
    /// Noteworthy events (e.g. `"oom"`).
    #[prost(string, repeated, tag = "2")]
    pub events: Vec<String>,
    #[prost(string, optional, tag = "3")]
    pub host_ip: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub container_ip: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub container_path: Option<String>,
    /// Ids of processes currently running in the container.
    #[prost(uint64, repeated, tag = "6")]
    pub process_ids: Vec<u64>,
}

/// Liveness probe; the server echoes the message back.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoRequest {
    #[prost(string, optional, tag = "1")]
    pub message: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoResponse {
    #[prost(string, optional, tag = "1")]
    pub message: Option<String>,
}

// =============================================================================
// Fault
// =============================================================================

/// Server-originated failure, carried in an [`MessageType::Error`] envelope.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorResponse {
    #[prost(string, optional, tag = "1")]
    pub message: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub data: Option<String>,
    #[prost(string, repeated, tag = "3")]
    pub backtrace: Vec<String>,
}

wire_message! {
    ErrorResponse => Error,
    CreateRequest => Create,
    CreateResponse => Create,
    StopRequest => Stop,
    StopResponse => Stop,
    DestroyRequest => Destroy,
    DestroyResponse => Destroy,
    InfoRequest => Info,
    InfoResponse => Info,
    SpawnRequest => Spawn,
    SpawnResponse => Spawn,
    LinkRequest => Link,
    LinkResponse => Link,
    RunRequest => Run,
    StreamRequest => Stream,
    StreamResponse => Stream,
    NetInRequest => NetIn,
    NetInResponse => NetIn,
    CopyInRequest => CopyIn,
    CopyInResponse => CopyIn,
    CopyOutRequest => CopyOut,
    CopyOutResponse => CopyOut,
    LimitMemoryRequest => LimitMemory,
    LimitMemoryResponse => LimitMemory,
    LimitDiskRequest => LimitDisk,
    LimitDiskResponse => LimitDisk,
    ListRequest => List,
    ListResponse => List,
    EchoRequest => Echo,
    EchoResponse => Echo,
    AttachRequest => Attach,
    ProcessPayload => ProcessPayload,
}

/// Builds the sorted `Property` list for a create/list request.
///
/// Pairs are sorted by key so that identical property maps always encode to
/// identical bytes.
pub(crate) fn properties_from(map: &std::collections::HashMap<String, String>) -> Vec<Property> {
    let mut pairs: Vec<(&String, &String)> = map.iter().collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(key, value)| Property {
            key: Some(key.clone()),
            value: Some(value.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;
    use std::collections::HashMap;

    #[test]
    fn paired_variants_share_a_tag() {
        assert_eq!(CreateRequest::TYPE, CreateResponse::TYPE);
        assert_eq!(RunRequest::TYPE, MessageType::Run);
        assert_eq!(ProcessPayload::TYPE, MessageType::ProcessPayload);
        assert_eq!(ErrorResponse::TYPE, MessageType::Error);
    }

    #[test]
    fn envelope_round_trips() {
        let req = StopRequest {
            handle: Some("foo".to_string()),
            background: Some(true),
            kill: Some(true),
        };

        let envelope = req.to_envelope();
        assert_eq!(envelope.r#type, MessageType::Stop as i32);

        let bytes = envelope.encode_to_vec();
        let decoded = Message::decode(&bytes[..]).unwrap();
        assert_eq!(decoded, envelope);

        let inner = StopRequest::decode(&decoded.payload[..]).unwrap();
        assert_eq!(inner, req);
    }

    #[test]
    fn payload_source_accessor() {
        let payload = ProcessPayload {
            process_id: Some(42),
            source: Some(ProcessSource::Stderr as i32),
            data: Some("oops".to_string()),
            exit_status: None,
        };
        assert_eq!(payload.stream_source(), Some(ProcessSource::Stderr));

        let bare = ProcessPayload::default();
        assert_eq!(bare.stream_source(), None);
    }

    #[test]
    fn properties_encode_deterministically() {
        let mut map = HashMap::new();
        map.insert("zeta".to_string(), "1".to_string());
        map.insert("alpha".to_string(), "2".to_string());

        let props = properties_from(&map);
        assert_eq!(props[0].key.as_deref(), Some("alpha"));
        assert_eq!(props[1].key.as_deref(), Some("zeta"));
    }
}
