//! Shared test scaffolding: spins up a real server on a loopback TCP
//! port and drives it with a hand-rolled `h2` client, so these tests
//! exercise the actual wire path without depending on an external gRPC
//! client crate.

use std::sync::Arc;

use bytes::Bytes;
use grpc_server_core::credentials::InsecureServerCredentials;
use grpc_server_core::handler::Handler;
use grpc_server_core::status::Status;
use grpc_server_core::{Server, ServerOptions};
use http::{HeaderMap, Request};
use tokio::net::TcpStream;

fn identity(bytes: Bytes) -> Result<Bytes, Status> {
    Ok(bytes)
}

/// Starts a server with a single `/demo.S/Echo` unary handler that
/// echoes its request back, listening on an OS-assigned loopback port.
pub async fn start_echo_server() -> (Server, u16) {
    let server = Server::new(ServerOptions::new());
    server
        .register(Handler::unary(
            "/demo.S/Echo",
            identity,
            identity,
            |request, _metadata| async move { Ok::<Bytes, Status>(request) },
        ))
        .unwrap();

    let port = server
        .bind_async("127.0.0.1:0", Arc::new(InsecureServerCredentials), None)
        .await
        .unwrap();
    server.start().unwrap();
    server.serve();

    (server, port)
}

/// Starts a server with a single `/demo.S/Stream` server-streaming
/// handler that sends three messages with a short gap between each,
/// used by the shutdown-draining scenarios.
pub async fn start_streaming_server() -> (Server, u16) {
    let server = Server::new(ServerOptions::new());
    server
        .register(Handler::server_streaming(
            "/demo.S/Stream",
            identity,
            |_request, _metadata, sink| async move {
                for i in 0..3u8 {
                    sink.send(Bytes::from(vec![i])).await?;
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                Ok(())
            },
        ))
        .unwrap();

    let port = server
        .bind_async("127.0.0.1:0", Arc::new(InsecureServerCredentials), None)
        .await
        .unwrap();
    server.start().unwrap();
    server.serve();

    (server, port)
}

pub struct UnaryReply {
    pub status_code: http::StatusCode,
    pub body: Option<Bytes>,
    pub trailers: HeaderMap,
}

/// Sends one gRPC unary request over a fresh HTTP/2 connection and
/// returns the decoded reply.
pub async fn send_unary(port: u16, path: &str, content_type: &str, body: &[u8]) -> UnaryReply {
    let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut send_request, connection) = h2::client::handshake(tcp).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let request = Request::builder()
        .method("POST")
        .uri(format!("http://127.0.0.1:{port}{path}"))
        .header("content-type", content_type)
        .body(())
        .unwrap();

    let (response_fut, mut send_stream) = send_request.send_request(request, false).unwrap();
    send_stream
        .send_data(grpc_server_core::framing::encode_message(body), true)
        .unwrap();

    let response = response_fut.await.unwrap();
    let status_code = response.status();
    let mut body_stream = response.into_body();

    let mut decoder = grpc_server_core::framing::FrameDecoder::new();
    while let Some(chunk) = body_stream.data().await {
        let chunk = chunk.unwrap();
        let len = chunk.len();
        decoder.push(&chunk);
        let _ = body_stream.flow_control().release_capacity(len);
    }
    let reply_body = decoder.next_message().unwrap();

    let trailers = body_stream.trailers().await.unwrap().unwrap_or_default();

    UnaryReply {
        status_code,
        body: reply_body,
        trailers,
    }
}

/// Sends one request and collects every gRPC-framed response message
/// the server sends before ending the stream, plus the final trailers.
pub async fn send_and_collect_stream(port: u16, path: &str, body: &[u8]) -> (Vec<Bytes>, HeaderMap) {
    let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut send_request, connection) = h2::client::handshake(tcp).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let request = Request::builder()
        .method("POST")
        .uri(format!("http://127.0.0.1:{port}{path}"))
        .header("content-type", "application/grpc")
        .body(())
        .unwrap();

    let (response_fut, mut send_stream) = send_request.send_request(request, false).unwrap();
    send_stream
        .send_data(grpc_server_core::framing::encode_message(body), true)
        .unwrap();

    let response = response_fut.await.unwrap();
    let mut body_stream = response.into_body();

    let mut decoder = grpc_server_core::framing::FrameDecoder::new();
    let mut messages = Vec::new();
    while let Some(chunk) = body_stream.data().await {
        let chunk = chunk.unwrap();
        let len = chunk.len();
        decoder.push(&chunk);
        let _ = body_stream.flow_control().release_capacity(len);
        while let Some(message) = decoder.next_message().unwrap() {
            messages.push(message);
        }
    }
    let trailers = body_stream.trailers().await.unwrap().unwrap_or_default();

    (messages, trailers)
}

pub fn grpc_status(reply: &UnaryReply) -> Option<i32> {
    reply
        .trailers
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}
