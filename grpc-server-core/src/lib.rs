//! A gRPC server runtime: HTTP/2 stream dispatch, bind/resolve, and
//! lifecycle telemetry, built directly on `h2` rather than a
//! higher-level RPC framework.
//!
//! The wire-level HTTP/2 implementation, message serialization, name
//! resolution, and TLS credential material are all treated as external
//! collaborators this crate consumes through small traits
//! ([`resolver::Resolver`], [`credentials::ServerCredentials`]) or
//! concrete `h2`/`rustls` types; this crate's own job is the RPC
//! dispatch state machine, the bind/resolve pipeline, and the
//! lifecycle/telemetry graph above them.

pub mod bind;
pub mod call_stream;
pub mod channelz;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod handler;
pub mod options;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod session;
pub mod status;

pub use error::{Result, ServerError};
pub use handler::{Handler, MethodDefinition, ResponseSink, ServiceDefinition, Shape};
pub use options::ServerOptions;
pub use server::Server;
pub use status::{Code, Status};
