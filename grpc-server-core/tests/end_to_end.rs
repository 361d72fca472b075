//! End-to-end scenarios driven over a real loopback HTTP/2 connection
//! (design §8's "happy unary" / "unimplemented" / "bad content-type"
//! scenarios).

mod common;

use common::{grpc_status, send_unary, start_echo_server};

#[tokio::test]
async fn happy_unary_echoes_request_body() {
    let (_server, port) = start_echo_server().await;

    let reply = send_unary(port, "/demo.S/Echo", "application/grpc", b"hi").await;

    assert_eq!(reply.status_code, http::StatusCode::OK);
    assert_eq!(reply.body.as_deref(), Some(&b"hi"[..]));
    assert_eq!(grpc_status(&reply), Some(0));
}

#[tokio::test]
async fn missing_method_returns_unimplemented() {
    let (_server, port) = start_echo_server().await;

    let reply = send_unary(port, "/demo.S/Missing", "application/grpc", b"hi").await;

    assert_eq!(grpc_status(&reply), Some(12));
    let message = reply
        .trailers
        .get("grpc-message")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert_eq!(message, "The server does not implement the method /demo.S/Missing");
}

#[tokio::test]
async fn wrong_content_type_yields_http_415() {
    let (server, port) = start_echo_server().await;

    let reply = send_unary(port, "/demo.S/Echo", "text/plain", b"hi").await;

    assert_eq!(reply.status_code, http::StatusCode::UNSUPPORTED_MEDIA_TYPE);

    // Let the session's per-call tracker observe the failed dispatch.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let info = server.get_telemetry_ref().unwrap().snapshot().unwrap();
    let grpc_server_core::channelz::Info::Server(server_info) = info else {
        panic!("expected a server snapshot");
    };
    assert_eq!(server_info.calls.started, 1);
    assert_eq!(server_info.calls.failed, 1);
}

#[tokio::test]
async fn server_can_be_bound_twice_with_distinct_ephemeral_ports() {
    let (_server_a, port_a) = start_echo_server().await;
    let (_server_b, port_b) = start_echo_server().await;
    assert_ne!(port_a, port_b);
}
