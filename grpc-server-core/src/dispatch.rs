//! Dispatch Core (design §4.4): the per-stream algorithm that turns one
//! accepted HTTP/2 request into a call against a registered [`Handler`].

use std::sync::Arc;

use bytes::Bytes;
use h2::server::SendResponse;
use h2::RecvStream;
use http::Request;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{field, instrument, Span};

use crate::call_stream::{CallReceiver, CallSender, CallStream};
use crate::channelz::CallTracker;
use crate::handler::{Handler, HandlerFn, MessageStream, ResponseSink};
use crate::registry::HandlerRegistry;
use crate::status::Status;

const UNSUPPORTED_MEDIA_TYPE: u16 = 415;

/// Dispatches one accepted HTTP/2 request/response pair against
/// `registry`. Never panics on a malformed request: every failure path
/// ends in a `CallStream::finish` with an appropriate `Status`, or (for
/// the content-type check, which happens before gRPC framing even
/// applies) a bare HTTP error response.
#[instrument(level = "info", skip_all, fields(path = field::Empty))]
pub async fn dispatch(
    request: Request<RecvStream>,
    respond: SendResponse<Bytes>,
    registry: HandlerRegistry,
    tracker: Arc<CallTracker>,
) {
    let path = request.uri().path().to_string();
    Span::current().record("path", field::display(&path));

    tracker.record_call_started();

    let content_type_ok = request
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/grpc"))
        .unwrap_or(false);

    if !content_type_ok {
        tracker.record_call_failed();
        reject_unsupported_media_type(respond);
        return;
    }

    let handler = match registry.lookup_or_unimplemented(&path) {
        Ok(handler) => handler,
        Err(status) => {
            let metadata = request.headers().clone();
            let recv = request.into_body();
            let call = CallStream::new(path, metadata, recv, respond, tracker);
            let _ = call.finish(status);
            return;
        }
    };

    let metadata = request.headers().clone();
    let recv = request.into_body();
    let mut call = CallStream::new(path, metadata.clone(), recv, respond, tracker);

    let status = run_handler(&handler, &mut call, metadata).await;
    let _ = call.finish(status);
}

async fn run_handler(handler: &Handler, call: &mut CallStream, metadata: http::HeaderMap) -> Status {
    match &handler.func {
        HandlerFn::Unary(f) => match call.recv_message().await {
            Ok(Some(request)) => match f(request, metadata).await {
                Ok(response) => match call.send_message(response).await {
                    Ok(()) => Status::ok(),
                    Err(status) => status,
                },
                Err(status) => status,
            },
            Ok(None) => Status::internal("client closed stream before sending a request"),
            Err(status) => status,
        },
        HandlerFn::ServerStreaming(f) => match call.recv_message().await {
            Ok(Some(request)) => {
                let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
                let sink = ResponseSink::new(tx);
                let (_, sender) = call.split_mut();
                let forward = forward_sink(rx, sender);
                let handler_fut = f(request, metadata, sink);
                let (forward_result, handler_result) = tokio::join!(forward, handler_fut);
                join_statuses(forward_result, handler_result)
            }
            Ok(None) => Status::internal("client closed stream before sending a request"),
            Err(status) => status,
        },
        HandlerFn::ClientStreaming(f) => {
            let (receiver, _) = call.split_mut();
            let (tx, rx) = tokio::sync::mpsc::channel(16);
            let stream: MessageStream = Box::pin(ReceiverStream::new(rx));
            let drain = drain_into_channel(receiver, tx);
            let handler_fut = f(stream, metadata);
            let (_, handler_result) = tokio::join!(drain, handler_fut);
            match handler_result {
                Ok(response) => match call.send_message(response).await {
                    Ok(()) => Status::ok(),
                    Err(status) => status,
                },
                Err(status) => status,
            }
        }
        HandlerFn::Bidi(f) => {
            let (receiver, sender) = call.split_mut();
            let (req_tx, req_rx) = tokio::sync::mpsc::channel(16);
            let stream: MessageStream = Box::pin(ReceiverStream::new(req_rx));
            let drain = drain_into_channel(receiver, req_tx);

            let (resp_tx, resp_rx) = tokio::sync::mpsc::channel::<Bytes>(16);
            let sink = ResponseSink::new(resp_tx);
            let forward = forward_sink(resp_rx, sender);

            let handler_fut = f(stream, metadata, sink);
            let (_, forward_result, handler_result) = tokio::join!(drain, forward, handler_fut);
            join_statuses(forward_result, handler_result)
        }
    }
}

fn join_statuses(forward: Result<(), Status>, handler: Result<(), Status>) -> Status {
    match forward {
        Ok(()) => match handler {
            Ok(()) => Status::ok(),
            Err(status) => status,
        },
        Err(status) => status,
    }
}

async fn forward_sink(mut rx: tokio::sync::mpsc::Receiver<Bytes>, sender: &mut CallSender) -> Result<(), Status> {
    while let Some(message) = rx.recv().await {
        sender.send_message(message).await?;
    }
    Ok(())
}

/// Drains `receiver` into an owned channel so the resulting
/// [`ReceiverStream`] can be handed to a handler as a `'static`
/// [`MessageStream`] without borrowing from the call itself, the
/// input-side counterpart of [`forward_sink`] on the output side.
async fn drain_into_channel(receiver: &mut CallReceiver, tx: tokio::sync::mpsc::Sender<Result<Bytes, Status>>) {
    loop {
        match receiver.recv_message().await {
            Ok(Some(message)) => {
                if tx.send(Ok(message)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(status) => {
                let _ = tx.send(Err(status)).await;
                return;
            }
        }
    }
}

fn reject_unsupported_media_type(mut respond: SendResponse<Bytes>) {
    let response = http::Response::builder()
        .status(UNSUPPORTED_MEDIA_TYPE)
        .body(())
        .expect("a fixed, valid response head");
    if let Ok(mut stream) = respond.send_response(response, false) {
        let _ = stream.send_data(Bytes::new(), true);
    }
}
