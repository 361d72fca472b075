//! Shutdown scenarios (design §8 "graceful shutdown with in-flight
//! call" / "force shutdown").

mod common;

use common::{send_and_collect_stream, start_streaming_server};

#[tokio::test]
async fn graceful_shutdown_lets_in_flight_stream_finish() {
    let (server, port) = start_streaming_server().await;

    let call = tokio::spawn(async move { send_and_collect_stream(port, "/demo.S/Stream", b"go").await });

    // Give the call a moment to start before shutting down, mirroring
    // the "after message 1" timing described in the scenario.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    server.try_shutdown().await;

    let (messages, trailers) = call.await.unwrap();
    assert_eq!(messages.len(), 3);
    let status: i32 = trailers
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap();
    assert_eq!(status, 0);
}

#[tokio::test]
async fn force_shutdown_clears_live_sessions() {
    let (server, _port) = start_streaming_server().await;

    // Let at least one session register before forcing shutdown.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    server.force_shutdown();

    assert!(server.get_telemetry_ref().is_none());
}
