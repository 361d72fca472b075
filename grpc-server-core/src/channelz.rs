//! Process-wide telemetry registry (channelz): assigns ids to server and
//! socket refs and serves on-demand snapshots of their live state.
//!
//! Grounded on design §4.3/§6: "The snapshot function is invoked on
//! demand by telemetry consumers; it must not cache." Snapshot closures
//! are therefore stored and called lazily, never memoized here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// What kind of entity a [`TelemetryRef`] stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Server,
    Socket,
}

/// Live counters for one HTTP/2 session or server, read fresh on every
/// snapshot (design invariant 5: monotonically non-decreasing for the
/// life of the owning record).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamCounters {
    pub started: i64,
    pub succeeded: i64,
    pub failed: i64,
}

/// A point-in-time snapshot of a server's observable state.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub calls: StreamCounters,
}

/// A point-in-time snapshot of a socket's (listener's or session's)
/// observable state. Fields the transport cannot supply (e.g. TLS fields
/// on a plaintext session) are `None`, per design §9's second open
/// question, absence is not an error.
#[derive(Debug, Clone, Default)]
pub struct SocketInfo {
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub tls_cipher_suite: Option<String>,
    pub local_certificate: Option<Vec<u8>>,
    pub remote_certificate: Option<Vec<u8>>,
    pub streams: StreamCounters,
    pub messages_sent: i64,
    pub messages_received: i64,
    pub local_flow_control_window: Option<i32>,
    pub remote_flow_control_window: Option<i32>,
}

/// Either snapshot shape a [`TelemetryRef`] can produce.
#[derive(Debug, Clone)]
pub enum Info {
    Server(ServerInfo),
    Socket(SocketInfo),
}

type SnapshotFn = Arc<dyn Fn() -> Info + Send + Sync>;

struct RefEntry {
    kind: RefKind,
    snapshot: SnapshotFn,
}

/// A registered, observable identifier. Cloning is cheap (it's an id plus
/// an `Arc` to the registry); the registry itself holds the strong
/// reference to the snapshot closure, so a dropped `TelemetryRef` does
/// not remove the entry; only an explicit [`ChannelzRegistry::unregister`]
/// does, matching design invariant 6 (unregistered exactly once).
#[derive(Clone)]
pub struct TelemetryRef {
    pub id: i64,
    pub kind: RefKind,
    registry: ChannelzRegistry,
}

impl std::fmt::Debug for TelemetryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryRef")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl TelemetryRef {
    /// Invoke the live snapshot function. Returns `None` if the ref was
    /// already unregistered.
    pub fn snapshot(&self) -> Option<Info> {
        self.registry.snapshot(self.id)
    }
}

/// Process-wide registry of [`TelemetryRef`]s. Cheaply `Clone`-able (an
/// `Arc` around the shared table); every server constructed by this
/// crate shares the same process-wide registry unless a dedicated one is
/// built for test isolation via [`ChannelzRegistry::new`].
#[derive(Clone)]
pub struct ChannelzRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    next_id: AtomicI64,
    entries: Mutex<HashMap<i64, RefEntry>>,
}

impl Default for ChannelzRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelzRegistry {
    pub fn new() -> Self {
        ChannelzRegistry {
            inner: Arc::new(Inner {
                next_id: AtomicI64::new(1),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn register(&self, kind: RefKind, snapshot: SnapshotFn) -> TelemetryRef {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .entries
            .lock()
            .unwrap()
            .insert(id, RefEntry { kind, snapshot });
        TelemetryRef {
            id,
            kind,
            registry: self.clone(),
        }
    }

    pub fn register_server(&self, snapshot: impl Fn() -> ServerInfo + Send + Sync + 'static) -> TelemetryRef {
        self.register(RefKind::Server, Arc::new(move || Info::Server(snapshot())))
    }

    pub fn register_socket(&self, snapshot: impl Fn() -> SocketInfo + Send + Sync + 'static) -> TelemetryRef {
        self.register(RefKind::Socket, Arc::new(move || Info::Socket(snapshot())))
    }

    /// Removes the entry. Idempotent: unregistering twice is a no-op on
    /// the second call, which is what lets concurrent `tryShutdown` +
    /// `forceShutdown` both call it safely (design invariant 6).
    pub fn unregister(&self, tref: &TelemetryRef) {
        self.inner.entries.lock().unwrap().remove(&tref.id);
    }

    fn snapshot(&self, id: i64) -> Option<Info> {
        let entries = self.inner.entries.lock().unwrap();
        entries.get(&id).map(|e| (e.snapshot)())
    }
}

/// Tracks the children of a parent ref (e.g. a server's listeners and
/// sessions) via weak references, per design §5 ("Telemetry refs are
/// shared ownership: the registry holds one reference, parent trackers
/// hold weak references").
#[derive(Default)]
pub struct ChildrenTracker {
    children: Mutex<Vec<Weak<TelemetryRef>>>,
}

impl ChildrenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ref_child(&self, child: &Arc<TelemetryRef>) {
        self.children.lock().unwrap().push(Arc::downgrade(child));
    }

    pub fn unref_child(&self, child: &Arc<TelemetryRef>) {
        let mut children = self.children.lock().unwrap();
        children.retain(|weak| match weak.upgrade() {
            Some(existing) => existing.id != child.id,
            None => false,
        });
    }

    /// Returns the ids of all children still alive.
    pub fn child_lists(&self) -> Vec<i64> {
        let children = self.children.lock().unwrap();
        children.iter().filter_map(|w| w.upgrade().map(|r| r.id)).collect()
    }
}

/// The most recently observed HTTP/2 flow-control windows for a session,
/// per design §5. Tracked as a simple "last call wins" snapshot rather
/// than per-stream, matching the socket-level (not call-level) shape of
/// `SocketInfo`.
#[derive(Debug, Clone, Copy, Default)]
struct FlowControlWindows {
    local: Option<i32>,
    remote: Option<i32>,
}

/// Per-call counters exposed by a server or session ref. Plain atomics:
/// design invariant 5 requires monotonic non-decreasing counts, which
/// atomics give for free without a lock.
#[derive(Default)]
pub struct CallTracker {
    pub calls_started: AtomicI64,
    pub calls_succeeded: AtomicI64,
    pub calls_failed: AtomicI64,
    messages_sent: AtomicI64,
    messages_received: AtomicI64,
    last_call_started_at: Mutex<Option<std::time::SystemTime>>,
    flow_control: Mutex<FlowControlWindows>,
}

impl CallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call_started(&self) {
        self.calls_started.fetch_add(1, Ordering::Relaxed);
        *self.last_call_started_at.lock().unwrap() = Some(std::time::SystemTime::now());
    }

    pub fn record_call_succeeded(&self) {
        self.calls_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_failed(&self) {
        self.calls_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Bumped once per message handed to the HTTP/2 send stream (design
    /// §4.4 step 5, "sendMessage").
    pub fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Bumped once per message assembled from the HTTP/2 receive stream
    /// (design §4.4 step 5, "receiveMessage").
    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_flow_control_window(&self, window: i32) {
        self.flow_control.lock().unwrap().local = Some(window);
    }

    pub fn record_remote_flow_control_window(&self, window: i32) {
        self.flow_control.lock().unwrap().remote = Some(window);
    }

    pub fn message_counts(&self) -> (i64, i64) {
        (
            self.messages_sent.load(Ordering::Relaxed),
            self.messages_received.load(Ordering::Relaxed),
        )
    }

    pub fn flow_control_windows(&self) -> (Option<i32>, Option<i32>) {
        let windows = self.flow_control.lock().unwrap();
        (windows.local, windows.remote)
    }

    pub fn snapshot(&self) -> StreamCounters {
        StreamCounters {
            started: self.calls_started.load(Ordering::Relaxed),
            succeeded: self.calls_succeeded.load(Ordering::Relaxed),
            failed: self.calls_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_not_cached() {
        let registry = ChannelzRegistry::new();
        let counter = Arc::new(AtomicI64::new(0));
        let counter2 = counter.clone();
        let tref = registry.register_server(move || {
            counter2.fetch_add(1, Ordering::Relaxed);
            ServerInfo::default()
        });

        tref.snapshot();
        tref.snapshot();
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ChannelzRegistry::new();
        let tref = registry.register_server(ServerInfo::default);
        registry.unregister(&tref);
        registry.unregister(&tref);
        assert!(tref.snapshot().is_none());
    }

    #[test]
    fn call_tracker_counts_monotonically() {
        let tracker = CallTracker::new();
        tracker.record_call_started();
        tracker.record_call_started();
        tracker.record_call_succeeded();
        let snap = tracker.snapshot();
        assert_eq!(snap.started, 2);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.failed, 0);
    }

    #[test]
    fn children_tracker_drops_unreffed_children() {
        let registry = ChannelzRegistry::new();
        let tracker = ChildrenTracker::new();
        let child = Arc::new(registry.register_socket(SocketInfo::default));
        tracker.ref_child(&child);
        assert_eq!(tracker.child_lists(), vec![child.id]);
        tracker.unref_child(&child);
        assert!(tracker.child_lists().is_empty());
    }
}
