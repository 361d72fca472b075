//! Session Manager (design §4.3): owns the lifecycle of one accepted
//! HTTP/2 connection from handshake through its last stream closing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use h2::server::Handshake;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{instrument, warn};

use crate::channelz::{CallTracker, ChannelzRegistry, SocketInfo, StreamCounters, TelemetryRef};
use crate::dispatch::dispatch;
use crate::registry::HandlerRegistry;

/// One accepted HTTP/2 session. Registered with the telemetry registry
/// the moment it's constructed and unregistered exactly once, whether
/// that happens because the connection ran its course or because the
/// server forced it shut before a single stream opened (design §4.3,
/// "started=false early-destroy path").
pub struct Session {
    peer: SocketAddr,
    local: SocketAddr,
    started: AtomicBool,
    pub(crate) tracker: Arc<CallTracker>,
    telemetry: Mutex<Option<TelemetryRef>>,
}

impl Session {
    pub fn new(peer: SocketAddr, local: SocketAddr) -> Arc<Self> {
        Arc::new(Session {
            peer,
            local,
            started: AtomicBool::new(false),
            tracker: Arc::new(CallTracker::new()),
            telemetry: Mutex::new(None),
        })
    }

    /// Registers this session's telemetry ref. Called right after
    /// construction, before the h2 handshake even begins, so a session
    /// destroyed before it ever accepted a stream is still observable
    /// while it exists (design §4.3 invariant).
    pub fn register(self: &Arc<Self>, registry: &ChannelzRegistry) -> TelemetryRef {
        let weak_self = Arc::downgrade(self);
        let tref = registry.register_socket(move || {
            weak_self
                .upgrade()
                .map(|session| session.snapshot())
                .unwrap_or_default()
        });
        *self.telemetry.lock().unwrap() = Some(tref.clone());
        tref
    }

    fn snapshot(&self) -> SocketInfo {
        let (messages_sent, messages_received) = self.tracker.message_counts();
        let (local_flow_control_window, remote_flow_control_window) =
            self.tracker.flow_control_windows();
        SocketInfo {
            local_addr: Some(self.local),
            remote_addr: Some(self.peer),
            // TLS fields are left `None` here; a TLS-terminating caller
            // fills them in via a dedicated socket wrapper, since this
            // type has no opinion on the transport below `h2`.
            tls_cipher_suite: None,
            local_certificate: None,
            remote_certificate: None,
            streams: self.tracker.snapshot(),
            messages_sent,
            messages_received,
            local_flow_control_window,
            remote_flow_control_window,
        }
    }

    pub fn unregister(&self, registry: &ChannelzRegistry) {
        if let Some(tref) = self.telemetry.lock().unwrap().take() {
            registry.unregister(&tref);
        }
    }
}

/// Runs one accepted connection to completion: performs the h2
/// handshake, then dispatches every stream it yields to the Dispatch
/// Core as a separately spawned task (design §5, "one task per
/// dispatched stream").
#[instrument(level = "info", skip_all, fields(peer = %session.peer))]
pub async fn run_session<IO>(
    io: IO,
    session: Arc<Session>,
    registry: HandlerRegistry,
    max_concurrent_streams: Option<u32>,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut builder = h2::server::Builder::new();
    builder.max_header_list_size(crate::options::MAX_HEADER_LIST_SIZE);
    if let Some(max) = max_concurrent_streams {
        builder.max_concurrent_streams(max);
    }

    let handshake: Handshake<IO, Bytes> = builder.handshake(io);
    let mut connection = match handshake.await {
        Ok(connection) => connection,
        Err(err) => {
            warn!(error = %err, "h2 handshake failed");
            return;
        }
    };

    session.started.store(true, Ordering::Relaxed);

    loop {
        match connection.accept().await {
            Some(Ok((request, respond))) => {
                let registry = registry.clone();
                let tracker = session.tracker.clone();
                tokio::spawn(async move {
                    dispatch(request, respond, registry, tracker).await;
                });
            }
            Some(Err(err)) => {
                warn!(error = %err, "stream accept failed");
                break;
            }
            None => break,
        }
    }
}
