//! Minimal echo service exercising all four streaming shapes against
//! `grpc-server-core` directly, with no code generation: request and
//! response messages are plain UTF-8 bytes, so `serialize`/`deserialize`
//! are the identity function.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use grpc_server_core::credentials::InsecureServerCredentials;
use grpc_server_core::handler::{Handler, MethodDefinition, ResponseSink};
use grpc_server_core::status::Status;
use grpc_server_core::{Server, ServerOptions, ServiceDefinition};
use tokio_stream::StreamExt;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "echo-demo", about = "Demo gRPC server built on grpc-server-core")]
struct Cli {
    /// Port to listen on (0 for an OS-assigned ephemeral port)
    #[arg(short = 'p', long = "port", default_value_t = 0)]
    port: u16,
}

fn identity(bytes: Bytes) -> Result<Bytes, Status> {
    Ok(bytes)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let server = Server::new(ServerOptions::new().max_concurrent_streams(100));

    let definition = ServiceDefinition::new()
        .method(MethodDefinition {
            name: "Echo".to_string(),
            original_name: None,
            request_stream: false,
            response_stream: false,
            handler_factory: Box::new(|path| {
                Handler::unary(path, identity, identity, |request, _metadata| async move {
                    Ok::<Bytes, Status>(request)
                })
            }),
        })
        .method(MethodDefinition {
            name: "EchoStream".to_string(),
            original_name: None,
            request_stream: false,
            response_stream: true,
            handler_factory: Box::new(|path| {
                Handler::server_streaming(path, identity, echo_stream)
            }),
        })
        .method(MethodDefinition {
            name: "EchoCollect".to_string(),
            original_name: None,
            request_stream: true,
            response_stream: false,
            handler_factory: Box::new(|path| {
                Handler::client_streaming(path, identity, identity, echo_collect)
            }),
        })
        .method(MethodDefinition {
            name: "EchoRelay".to_string(),
            original_name: None,
            request_stream: true,
            response_stream: true,
            handler_factory: Box::new(|path| Handler::bidi(path, identity, echo_relay)),
        });

    server.add_service("demo.Echo", definition)?;

    let port = server
        .bind_async(
            &format!("127.0.0.1:{}", cli.port),
            Arc::new(InsecureServerCredentials),
            None,
        )
        .await?;
    info!(port, "bound listener");

    server.start()?;
    server.serve();

    info!("echo-demo listening on 127.0.0.1:{port}");
    tokio::signal::ctrl_c().await?;
    server.try_shutdown().await;
    Ok(())
}

/// Splits the request on whitespace and sends each word back as its own
/// response message, with a short gap between sends.
async fn echo_stream(request: Bytes, _metadata: http::HeaderMap, sink: ResponseSink) -> Result<(), Status> {
    let text = String::from_utf8_lossy(&request).to_string();
    for word in text.split_whitespace() {
        sink.send(Bytes::copy_from_slice(word.as_bytes())).await?;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Collects every request message and joins them with a space.
async fn echo_collect(
    mut requests: std::pin::Pin<Box<dyn futures_core::Stream<Item = Result<Bytes, Status>> + Send>>,
    _metadata: http::HeaderMap,
) -> Result<Bytes, Status> {
    let mut parts = Vec::new();
    while let Some(message) = requests.next().await {
        parts.push(String::from_utf8_lossy(&message?).to_string());
    }
    Ok(Bytes::from(parts.join(" ")))
}

/// Echoes each incoming message back as soon as it arrives.
async fn echo_relay(
    mut requests: std::pin::Pin<Box<dyn futures_core::Stream<Item = Result<Bytes, Status>> + Send>>,
    _metadata: http::HeaderMap,
    sink: ResponseSink,
) -> Result<(), Status> {
    while let Some(message) = requests.next().await {
        sink.send(message?).await?;
    }
    Ok(())
}
