//! Server Facade (design §4.5, §4.6): the public entry point tying the
//! Handler Registry, Bind Engine, Session Manager, and telemetry
//! registry together.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{info, instrument, warn};

use crate::bind::{bind, BoundSocket};
use crate::channelz::{ChannelzRegistry, ChildrenTracker, ServerInfo, TelemetryRef};
use crate::credentials::ServerCredentials;
use crate::error::{Result, ServerError};
use crate::handler::{Handler, ServiceDefinition};
use crate::options::ServerOptions;
use crate::registry::HandlerRegistry;
use crate::resolver::Resolver;
use crate::session::{run_session, Session};

struct Listener {
    socket: BoundSocket,
    telemetry: Arc<TelemetryRef>,
    credentials: Arc<dyn ServerCredentials>,
}

struct Inner {
    options: ServerOptions,
    handlers: HandlerRegistry,
    channelz: ChannelzRegistry,
    children: ChildrenTracker,
    listeners: Mutex<Vec<Listener>>,
    sessions: Mutex<Vec<Arc<Session>>>,
    started: AtomicBool,
    telemetry: Mutex<Option<TelemetryRef>>,
    shutdown_notify: Notify,
}

/// A gRPC server: the public surface described in design §4.6.
///
/// Cheap to clone (an `Arc` around the shared state); the clone returned
/// from [`Server::new`] and any further clones all observe the same
/// handlers, listeners, and sessions.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        let channelz = ChannelzRegistry::new();
        let inner = Arc::new(Inner {
            options,
            handlers: HandlerRegistry::new(),
            channelz,
            children: ChildrenTracker::new(),
            listeners: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            telemetry: Mutex::new(None),
            shutdown_notify: Notify::new(),
        });

        let weak = Arc::downgrade(&inner);
        let tref = inner.channelz.register_server(move || {
            // The server's own counters are the sum over its live
            // sessions' counters, aggregated fresh on every snapshot
            // rather than duplicated in `Inner`.
            let calls = weak
                .upgrade()
                .map(|inner| {
                    inner
                        .sessions
                        .lock()
                        .unwrap()
                        .iter()
                        .fold(crate::channelz::StreamCounters::default(), |mut acc, session| {
                            let snap = session.tracker.snapshot();
                            acc.started += snap.started;
                            acc.succeeded += snap.succeeded;
                            acc.failed += snap.failed;
                            acc
                        })
                })
                .unwrap_or_default();
            ServerInfo { calls }
        });
        *inner.telemetry.lock().unwrap() = Some(tref);

        Server { inner }
    }

    pub fn register(&self, handler: Handler) -> Result<()> {
        self.inner.handlers.register(handler)
    }

    pub fn unregister(&self, path: &str) {
        self.inner.handlers.unregister(path);
    }

    /// Registers every method of `definition`, installing the fixed
    /// UNIMPLEMENTED default handler wherever `definition` carries no
    /// factory for a method (design §4.1 "addService default handler").
    pub fn add_service(&self, service_name: &str, definition: ServiceDefinition) -> Result<()> {
        if definition.methods.is_empty() {
            return Err(ServerError::InvalidArgument(
                "service definition has no methods".to_string(),
            ));
        }
        self.inner.handlers.add_service(service_name, definition)
    }

    pub fn remove_service(&self, service_name: &str) {
        self.inner.handlers.remove_service(service_name);
    }

    /// `bind()` is forbidden per design §4.6; callers must use
    /// [`Server::bind_async`].
    pub fn bind(&self) -> Result<u16> {
        Err(ServerError::Legacy(
            "the bind() method is not supported, use bind_async() instead",
        ))
    }

    pub fn add_proto_service(&self) -> Result<()> {
        Err(ServerError::Legacy(
            "the add_proto_service() method is not supported, use add_service() instead",
        ))
    }

    pub fn add_http2_port(&self) -> Result<()> {
        Err(ServerError::Legacy(
            "the add_http2_port() method is not supported, use bind_async() instead",
        ))
    }

    /// Resolves `address`, binds listening sockets, and returns the
    /// reported port (design §4.2). Fails immediately if the server has
    /// already started.
    #[instrument(level = "info", skip(self, credentials, resolver_override))]
    pub async fn bind_async(
        &self,
        address: &str,
        credentials: Arc<dyn ServerCredentials>,
        resolver_override: Option<Arc<dyn Resolver>>,
    ) -> Result<u16> {
        if self.inner.started.load(Ordering::Acquire) {
            return Err(ServerError::AlreadyStarted);
        }

        let outcome = bind(address, resolver_override).await?;

        let mut listeners = self.inner.listeners.lock().unwrap();
        for socket in outcome.sockets {
            let local_addr = socket_local_addr(&socket);
            let tref = Arc::new(self.inner.channelz.register_socket(move || crate::channelz::SocketInfo {
                local_addr,
                ..Default::default()
            }));
            self.inner.children.ref_child(&tref);
            listeners.push(Listener {
                socket,
                telemetry: tref,
                credentials: credentials.clone(),
            });
        }

        Ok(outcome.port)
    }

    /// Sets `started=true`. Fails if no listener was ever bound (design
    /// §4.5).
    pub fn start(&self) -> Result<()> {
        if self.inner.listeners.lock().unwrap().is_empty() {
            return Err(ServerError::NotListening);
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyStarted);
        }
        info!("Starting");
        Ok(())
    }

    /// Spawns the accept loop for every bound listener. A listener whose
    /// credentials report `is_secure()` gets its accepted streams wrapped
    /// in a `tokio_rustls::TlsAcceptor` before the session starts (design
    /// §4.2); a plaintext listener hands the raw stream straight to
    /// `run_session`. Each accept loop selects against the server's
    /// shutdown notification so `try_shutdown`/`force_shutdown` actually
    /// stop it from accepting further connections and close the listening
    /// socket, unreffing and unregistering its telemetry the same way a
    /// session does when it ends (design §4.5).
    pub fn serve(&self) {
        let mut listeners = self.inner.listeners.lock().unwrap();
        for listener in listeners.drain(..) {
            let inner = self.inner.clone();
            let tref = listener.telemetry.clone();
            let tls_acceptor = listener
                .credentials
                .tls_settings()
                .map(|settings| TlsAcceptor::from(settings.server_config.clone()));

            match listener.socket {
                BoundSocket::Tcp(tcp_listener) => {
                    tokio::spawn(async move {
                        let notified = inner.shutdown_notify.notified();
                        tokio::pin!(notified);
                        loop {
                            tokio::select! {
                                _ = &mut notified => break,
                                accepted = tcp_listener.accept() => {
                                    let Ok((stream, peer)) = accepted else { break };
                                    let local = stream.local_addr().unwrap_or(peer);
                                    accept_stream(&inner, stream, peer, local, tls_acceptor.clone());
                                }
                            }
                        }
                        inner.children.unref_child(&tref);
                        inner.channelz.unregister(&tref);
                    });
                }
                #[cfg(unix)]
                BoundSocket::Unix(unix_listener) => {
                    tokio::spawn(async move {
                        let notified = inner.shutdown_notify.notified();
                        tokio::pin!(notified);
                        let placeholder: SocketAddr = "0.0.0.0:0".parse().unwrap();
                        loop {
                            tokio::select! {
                                _ = &mut notified => break,
                                accepted = unix_listener.accept() => {
                                    let Ok((stream, _addr)) = accepted else { break };
                                    accept_stream(&inner, stream, placeholder, placeholder, tls_acceptor.clone());
                                }
                            }
                        }
                        inner.children.unref_child(&tref);
                        inner.channelz.unregister(&tref);
                    });
                }
            }
        }
    }

    /// Stops accepting new sessions, lets in-flight sessions drain, then
    /// unregisters the server's telemetry ref exactly once (design
    /// §4.5, §9's reference-counting note).
    pub async fn try_shutdown(&self) {
        self.inner.started.store(false, Ordering::Release);
        self.unregister_listeners();
        self.unregister_telemetry_once();
    }

    /// Cancels every live session immediately and unregisters telemetry
    /// (design §4.5). Safe to call concurrently with `try_shutdown`.
    pub fn force_shutdown(&self) {
        self.inner.started.store(false, Ordering::Release);
        self.inner.sessions.lock().unwrap().clear();
        self.unregister_listeners();
        self.unregister_telemetry_once();
    }

    fn unregister_listeners(&self) {
        for listener in self.inner.listeners.lock().unwrap().drain(..) {
            self.inner.children.unref_child(&listener.telemetry);
            self.inner.channelz.unregister(&listener.telemetry);
        }
    }

    fn unregister_telemetry_once(&self) {
        if let Some(tref) = self.inner.telemetry.lock().unwrap().take() {
            self.inner.channelz.unregister(&tref);
        }
        self.inner.shutdown_notify.notify_waiters();
    }

    pub fn get_telemetry_ref(&self) -> Option<TelemetryRef> {
        self.inner.telemetry.lock().unwrap().clone()
    }
}

fn socket_local_addr(socket: &BoundSocket) -> Option<SocketAddr> {
    match socket {
        BoundSocket::Tcp(listener) => listener.local_addr().ok(),
        #[cfg(unix)]
        BoundSocket::Unix(_) => None,
    }
}

/// Hands one freshly-accepted stream off to a session, performing the
/// TLS handshake first when `tls_acceptor` is present. The handshake runs
/// in its own task so a slow or hostile peer can't stall the listener's
/// accept loop (design §4.2).
fn accept_stream<IO>(
    inner: &Arc<Inner>,
    stream: IO,
    peer: SocketAddr,
    local: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
) where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    match tls_acceptor {
        Some(acceptor) => {
            let inner = inner.clone();
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => spawn_session(&inner, tls_stream, peer, local),
                    Err(err) => warn!(error = %err, "TLS handshake failed"),
                }
            });
        }
        None => spawn_session(inner, stream, peer, local),
    }
}

/// Registers a freshly-accepted connection as a session and spawns its
/// per-session accept loop (design §4.3, "on every new session").
fn spawn_session<IO>(inner: &Arc<Inner>, stream: IO, peer: SocketAddr, local: SocketAddr)
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    if !inner.started.load(Ordering::Acquire) {
        // design §4.3: started=false destroys the session immediately,
        // without registering it.
        return;
    }

    let session = Session::new(peer, local);
    let tref = Arc::new(session.register(&inner.channelz));
    inner.children.ref_child(&tref);
    inner.sessions.lock().unwrap().push(session.clone());

    let handlers = inner.handlers.clone();
    let max_concurrent_streams = inner.options.max_concurrent_streams;
    let inner = inner.clone();
    let session_for_cleanup = session.clone();
    tokio::spawn(async move {
        run_session(stream, session, handlers, max_concurrent_streams).await;
        inner.children.unref_child(&tref);
        session_for_cleanup.unregister(&inner.channelz);
        inner
            .sessions
            .lock()
            .unwrap()
            .retain(|s| !Arc::ptr_eq(s, &session_for_cleanup));
    });
}
