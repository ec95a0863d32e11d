//! Client/pool tests against scripted providers.
//!
//! These run with `start_paused` so the pool's acquire, park and redial
//! timers fire instantly instead of stretching the suite out by wall-clock
//! seconds.

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use warden_client::codec::encode_frame;
use warden_client::protocol::{
    CreateRequest, CreateResponse, DestroyRequest, DestroyResponse, ErrorResponse, ProcessPayload,
    ProcessSource, ResourceLimits as WireResourceLimits, RunRequest, SpawnRequest, SpawnResponse,
    StopRequest, StopResponse, StreamRequest, StreamResponse,
};
use warden_client::{Client, ResourceLimits};

use support::{fake_connection, FailingProvider, SequenceProvider};

// =============================================================================
// Helpers
// =============================================================================

fn client_over(connections: Vec<warden_client::Connection>) -> Client {
    Client::new(Arc::new(SequenceProvider::new(connections)))
}

fn handle(name: &str) -> Option<String> {
    Some(name.to_string())
}

// =============================================================================
// Connect
// =============================================================================

#[tokio::test]
async fn connect_surfaces_the_provider_error() {
    let client = Client::new(Arc::new(FailingProvider));
    let err = client.connect().await.unwrap_err();
    assert!(err.to_string().contains("nope!"));
}

#[tokio::test]
async fn connect_succeeds_with_a_working_provider() {
    let (conn, _wire) = fake_connection(Vec::new());
    let client = client_over(vec![conn]);
    client.connect().await.unwrap();
}

// =============================================================================
// Container Lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn container_lifecycle_reuses_one_connection() {
    let mut seeded = Vec::new();
    seeded.extend(encode_frame(&CreateResponse { handle: handle("foo") }));
    seeded.extend(encode_frame(&StopResponse {}));
    seeded.extend(encode_frame(&DestroyResponse {}));

    let (conn, wire) = fake_connection(seeded);
    let client = client_over(vec![conn]);
    client.connect().await.unwrap();

    let created = client.create(&HashMap::new()).await.unwrap();
    assert_eq!(created.handle.as_deref(), Some("foo"));

    client.stop("foo", true, true).await.unwrap();
    client.destroy("foo").await.unwrap();

    let mut expected = encode_frame(&CreateRequest { properties: Vec::new() });
    expected.extend(encode_frame(&StopRequest {
        handle: handle("foo"),
        background: Some(true),
        kill: Some(true),
    }));
    expected.extend(encode_frame(&DestroyRequest { handle: handle("foo") }));
    assert_eq!(wire.written(), expected);
}

// =============================================================================
// Reconnection
// =============================================================================

#[tokio::test(start_paused = true)]
async fn client_reconnects_after_the_connection_breaks() {
    let mut first_seeded = Vec::new();
    first_seeded.extend(encode_frame(&CreateResponse {
        handle: handle("handle a"),
    }));
    // No response for the second create; it hits EOF.

    let (first_conn, first_wire) = fake_connection(first_seeded);
    let (second_conn, second_wire) =
        fake_connection(encode_frame(&DestroyResponse {}));

    let client = client_over(vec![first_conn, second_conn]);
    client.connect().await.unwrap();

    let created = client.create(&HashMap::new()).await.unwrap();
    let container = created.handle.unwrap();
    assert_eq!(container, "handle a");

    let err = client.create(&HashMap::new()).await.unwrap_err();
    assert!(matches!(err, warden_client::Error::Disconnected));

    // The broken connection never returns to the slot, so this acquire
    // times out and dials the second connection.
    client.destroy(&container).await.unwrap();

    let mut first_expected = encode_frame(&CreateRequest { properties: Vec::new() });
    first_expected.extend(encode_frame(&CreateRequest { properties: Vec::new() }));
    assert_eq!(first_wire.written(), first_expected);

    assert_eq!(
        second_wire.written(),
        encode_frame(&DestroyRequest {
            handle: handle("handle a"),
        })
    );
}

// =============================================================================
// Streaming
// =============================================================================

#[tokio::test(start_paused = true)]
async fn run_streams_through_the_proxy_channel() {
    let mut seeded = Vec::new();
    seeded.extend(encode_frame(&ProcessPayload {
        process_id: Some(42),
        ..Default::default()
    }));
    seeded.extend(encode_frame(&ProcessPayload {
        process_id: Some(42),
        source: Some(ProcessSource::Stdout as i32),
        data: Some("1".to_string()),
        exit_status: None,
    }));
    seeded.extend(encode_frame(&ProcessPayload {
        process_id: Some(42),
        exit_status: Some(3),
        ..Default::default()
    }));

    let (conn, wire) = fake_connection(seeded);
    let client = client_over(vec![conn]);
    client.connect().await.unwrap();

    let limits = ResourceLimits {
        file_descriptors: 72,
    };
    let (process_id, mut stream) = client.run("foo", "lol", limits).await.unwrap();
    assert_eq!(process_id, 42);

    let expected = encode_frame(&RunRequest {
        handle: handle("foo"),
        script: Some("lol".to_string()),
        rlimits: Some(WireResourceLimits { nofile: Some(72) }),
    });
    assert_eq!(wire.written(), expected);

    let output = stream.recv().await.unwrap();
    assert_eq!(output.data.as_deref(), Some("1"));

    let exit = stream.recv().await.unwrap();
    assert_eq!(exit.exit_status, Some(3));

    assert!(stream.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn run_releases_the_connection_after_a_server_error() {
    let mut seeded = Vec::new();
    seeded.extend(encode_frame(&ErrorResponse {
        message: Some("boo".to_string()),
        data: None,
        backtrace: Vec::new(),
    }));
    seeded.extend(encode_frame(&DestroyResponse {}));

    let (conn, wire) = fake_connection(seeded);
    let client = client_over(vec![conn]);
    client.connect().await.unwrap();

    let err = client
        .run("foo", "lol", ResourceLimits::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "boo");

    // The connection went back to the pool and serves the next call.
    client.destroy("foo").await.unwrap();

    let mut expected = encode_frame(&RunRequest {
        handle: handle("foo"),
        script: Some("lol".to_string()),
        rlimits: Some(WireResourceLimits::default()),
    });
    expected.extend(encode_frame(&DestroyRequest { handle: handle("foo") }));
    assert_eq!(wire.written(), expected);
}

#[tokio::test(start_paused = true)]
async fn legacy_spawn_then_stream() {
    let mut seeded = Vec::new();
    seeded.extend(encode_frame(&SpawnResponse { job_id: Some(42) }));
    seeded.extend(encode_frame(&StreamResponse {
        name: Some("stdout".to_string()),
        data: Some("some data for stdout".to_string()),
        exit_status: None,
    }));
    seeded.extend(encode_frame(&StreamResponse {
        name: None,
        data: None,
        exit_status: Some(0),
    }));

    let (conn, wire) = fake_connection(seeded);
    let client = client_over(vec![conn]);
    client.connect().await.unwrap();

    let spawned = client
        .spawn("foo", "echo some data for stdout", true)
        .await
        .unwrap();
    let job_id = spawned.job_id.unwrap();
    assert_eq!(job_id, 42);

    let (mut stream, done) = client.stream("foo", job_id).await.unwrap();

    let first = stream.recv().await.unwrap();
    assert_eq!(first.name.as_deref(), Some("stdout"));
    assert_eq!(first.data.as_deref(), Some("some data for stdout"));

    let second = stream.recv().await.unwrap();
    assert_eq!(second.exit_status, Some(0));

    assert!(stream.recv().await.is_none());
    done.await.unwrap();

    let mut expected = encode_frame(&SpawnRequest {
        handle: handle("foo"),
        script: Some("echo some data for stdout".to_string()),
        discard_output: Some(true),
    });
    expected.extend(encode_frame(&StreamRequest {
        handle: handle("foo"),
        job_id: Some(42),
    }));
    assert_eq!(wire.written(), expected);
}

// =============================================================================
// Parking
// =============================================================================

#[tokio::test(start_paused = true)]
async fn idle_parked_connection_is_closed() {
    let (conn, wire) = fake_connection(Vec::new());
    let client = client_over(vec![conn]);
    client.connect().await.unwrap();

    // Longer than the park timeout with no caller in sight.
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(wire.is_closed());
}
