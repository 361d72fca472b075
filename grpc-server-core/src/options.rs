//! Channel-options mapping consumed by the Bind Engine (design §4.2).
//!
//! Modeled on `grpcurl-core`'s `ConnectionConfig` builder
//! (`connection.rs`): a plain struct with `Option` fields built up by
//! chained setters, rather than a generic `HashMap<String, Value>` bag.
//! The handful of options this crate actually consumes are known ahead of
//! time, so a typed builder gives callers compile-time feedback instead of
//! silently ignored string keys.

/// Per-server options translated from the channel-options mapping named in
/// the design: `grpc-node.max_session_memory` and
/// `grpc.max_concurrent_streams`.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// `grpc-node.max_session_memory`: maximum session memory, in
    /// megabytes, applied per accepted HTTP/2 session.
    pub max_session_memory_mb: Option<u32>,

    /// `grpc.max_concurrent_streams`: HTTP/2 `SETTINGS_MAX_CONCURRENT_STREAMS`.
    pub max_concurrent_streams: Option<u32>,
}

/// The maximum send-header-block size this crate configures every listening
/// socket with, per design §4.2 ("configured to its maximum").
pub const MAX_HEADER_LIST_SIZE: u32 = u32::MAX;

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_session_memory_mb(mut self, mb: u32) -> Self {
        self.max_session_memory_mb = Some(mb);
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = Some(max);
        self
    }
}
