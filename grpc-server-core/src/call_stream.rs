//! `CallStream`: the per-stream handle the Dispatch Core builds over one
//! accepted HTTP/2 request/response pair (design §4.4, §6).
//!
//! Wraps `h2::server::SendResponse<Bytes>` and `h2::RecvStream` directly,
//! this crate treats HTTP/2 itself as an external collaborator, so no
//! higher-level request/response framework sits between this type and
//! the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use h2::server::SendResponse;
use h2::{RecvStream, SendStream};
use http::{HeaderMap, Response};

use crate::channelz::CallTracker;
use crate::framing::{encode_message, FrameDecoder};
use crate::status::{Code, Status};

const GRPC_STATUS: &str = "grpc-status";
const GRPC_MESSAGE: &str = "grpc-message";

/// The read half of a [`CallStream`]. Split out so client-streaming and
/// bidi dispatch can poll incoming messages and forward outgoing ones
/// concurrently without the two halves fighting over one `&mut`.
pub struct CallReceiver {
    recv: RecvStream,
    decoder: FrameDecoder,
    cancelled: Arc<AtomicBool>,
    tracker: Arc<CallTracker>,
}

impl CallReceiver {
    /// Reads and gRPC-unframes request data until exactly one message
    /// has been assembled, or the stream ends. Used directly by unary
    /// and server-streaming dispatch; client-streaming/bidi dispatch
    /// wraps repeated calls to this in a [`futures_core::Stream`].
    pub async fn recv_message(&mut self) -> Result<Option<Bytes>, Status> {
        loop {
            if let Some(message) = self.decoder.next_message()? {
                self.tracker.record_message_received();
                self.tracker
                    .record_local_flow_control_window(self.recv.flow_control().available_capacity() as i32);
                return Ok(Some(message));
            }

            match self.recv.data().await {
                Some(Ok(chunk)) => {
                    let len = chunk.len();
                    self.decoder.push(&chunk);
                    let _ = self.recv.flow_control().release_capacity(len);
                }
                Some(Err(err)) => {
                    if err.is_reset() {
                        self.cancelled.store(true, Ordering::Relaxed);
                        return Err(Status::new(Code::Cancelled, "stream reset by peer"));
                    }
                    return Err(Status::internal(format!("read failed: {err}")));
                }
                None => return Ok(None),
            }
        }
    }
}

/// The write half of a [`CallStream`]: response headers (sent lazily, on
/// the first message or on `finish`), framed messages, and trailers.
pub struct CallSender {
    send_response: SendResponse<Bytes>,
    body: Option<SendStream<Bytes>>,
    tracker: Arc<CallTracker>,
}

impl CallSender {
    /// Sends one gRPC-framed response message, emitting the `200 OK` /
    /// `grpc` content-type response headers on the first call (design
    /// §4.4 step 6).
    pub async fn send_message(&mut self, payload: Bytes) -> Result<(), Status> {
        self.ensure_headers_sent()?;
        let framed = encode_message(&payload);
        let body = self
            .body
            .as_mut()
            .expect("ensure_headers_sent leaves body populated");
        body.send_data(framed, false)
            .map_err(|e| Status::internal(format!("write failed: {e}")))?;
        self.tracker.record_message_sent();
        self.tracker
            .record_remote_flow_control_window(body.capacity() as i32);
        Ok(())
    }

    fn finish_trailers(&mut self, status: &Status) -> Result<(), Status> {
        self.ensure_headers_sent()?;

        let mut trailers = HeaderMap::new();
        trailers.insert(
            GRPC_STATUS,
            status
                .code()
                .value()
                .to_string()
                .parse()
                .expect("status code digits are a valid header value"),
        );
        if !status.message().is_empty() {
            if let Ok(value) = status.message().parse() {
                trailers.insert(GRPC_MESSAGE, value);
            }
        }

        self.body
            .take()
            .expect("ensure_headers_sent leaves body populated")
            .send_trailers(trailers)
            .map_err(|e| Status::internal(format!("failed to send trailers: {e}")))
    }

    fn ensure_headers_sent(&mut self) -> Result<(), Status> {
        if self.body.is_some() {
            return Ok(());
        }
        let response = Response::builder()
            .status(200)
            .header("content-type", "application/grpc")
            .body(())
            .expect("a fixed, valid response head");
        let stream = self
            .send_response
            .send_response(response, false)
            .map_err(|e| Status::internal(format!("failed to send headers: {e}")))?;
        self.body = Some(stream);
        Ok(())
    }
}

/// A single RPC's send/receive halves, plus the bookkeeping the Dispatch
/// Core needs to report call-level telemetry and cancellation.
pub struct CallStream {
    path: String,
    request_metadata: HeaderMap,
    receiver: CallReceiver,
    sender: CallSender,
    cancelled: Arc<AtomicBool>,
    tracker: Arc<CallTracker>,
}

impl CallStream {
    /// Builds the call's read/write halves over the accepted stream.
    /// Does not itself record `callsStarted`; the Dispatch Core counts
    /// every accepted stream at entry, before it knows whether a
    /// `CallStream` will ever be constructed for it (design §4.4 step 1).
    pub fn new(
        path: String,
        request_metadata: HeaderMap,
        recv: RecvStream,
        send_response: SendResponse<Bytes>,
        tracker: Arc<CallTracker>,
    ) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        CallStream {
            path,
            request_metadata,
            receiver: CallReceiver {
                recv,
                decoder: FrameDecoder::new(),
                cancelled: cancelled.clone(),
                tracker: tracker.clone(),
            },
            sender: CallSender {
                send_response,
                body: None,
                tracker: tracker.clone(),
            },
            cancelled,
            tracker,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The request headers, available synchronously the moment the
    /// stream is constructed (design §4.4 step 4, "metadata is already
    /// present").
    pub fn metadata(&self) -> &HeaderMap {
        &self.request_metadata
    }

    /// `true` once the peer has reset this stream. Checked by long-lived
    /// handlers (server-streaming, bidi) between message sends so they
    /// stop producing output for a client that already left.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Splits the call into its independent read and write halves so a
    /// handler can drain incoming messages and forward outgoing ones in
    /// the same `tokio::join!` without either side waiting on the other.
    pub fn split_mut(&mut self) -> (&mut CallReceiver, &mut CallSender) {
        (&mut self.receiver, &mut self.sender)
    }

    pub async fn recv_message(&mut self) -> Result<Option<Bytes>, Status> {
        self.receiver.recv_message().await
    }

    pub async fn send_message(&mut self, payload: Bytes) -> Result<(), Status> {
        self.sender.send_message(payload).await
    }

    /// Ends the stream with a final `Status`, sent as HTTP/2 trailers
    /// carrying `grpc-status`/`grpc-message` (design §4.4 step 8). Sends
    /// the success response headers first if no message was ever sent,
    /// matching a handler that returns `Ok(())` without producing output.
    pub fn finish(mut self, status: Status) -> Result<(), Status> {
        self.sender.finish_trailers(&status)?;

        if status.is_ok() {
            self.tracker.record_call_succeeded();
        } else {
            self.tracker.record_call_failed();
        }
        Ok(())
    }
}
