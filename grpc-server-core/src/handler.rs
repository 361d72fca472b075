//! Method handlers and service definitions (design §3, §4.1).
//!
//! Storage is fully type-erased to `Bytes` in and `Bytes` out. The
//! per-method `serialize`/`deserialize` closures are folded into the
//! erased handler closure at registration time, so the Dispatch Core
//! never has to know (or downcast) the request/response types a given
//! method actually uses. Callers of [`Handler::unary`] and its siblings
//! still work in terms of their own request/response types; only the
//! registry's internal representation is generic-free.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;

use crate::status::Status;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A stream of incoming request messages, already framed (gRPC
/// length-delimiter stripped) but not yet deserialized by the caller.
pub type MessageStream = Pin<Box<dyn futures_core::Stream<Item = Result<Bytes, Status>> + Send>>;

/// The streaming shape of a method, derived from `(requestStream,
/// responseStream)` per design §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Unary,
    ClientStreaming,
    ServerStreaming,
    Bidi,
}

impl Shape {
    pub fn from_streaming_flags(request_stream: bool, response_stream: bool) -> Shape {
        match (request_stream, response_stream) {
            (false, false) => Shape::Unary,
            (true, false) => Shape::ClientStreaming,
            (false, true) => Shape::ServerStreaming,
            (true, true) => Shape::Bidi,
        }
    }
}

/// Lets a server-streaming or bidi handler push zero or more response
/// messages before returning its final [`Status`].
#[derive(Clone)]
pub struct ResponseSink {
    tx: tokio::sync::mpsc::Sender<Bytes>,
}

impl ResponseSink {
    pub(crate) fn new(tx: tokio::sync::mpsc::Sender<Bytes>) -> Self {
        ResponseSink { tx }
    }

    /// Sends one serialized response message. Fails only if the peer has
    /// gone away (the stream's receive half was dropped).
    pub async fn send(&self, message: Bytes) -> Result<(), Status> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Status::internal("peer disconnected before message could be sent"))
    }
}

type UnaryErasedFn =
    Arc<dyn Fn(Bytes, HeaderMap) -> BoxFuture<'static, Result<Bytes, Status>> + Send + Sync>;
type ClientStreamErasedFn =
    Arc<dyn Fn(MessageStream, HeaderMap) -> BoxFuture<'static, Result<Bytes, Status>> + Send + Sync>;
type ServerStreamErasedFn = Arc<
    dyn Fn(Bytes, HeaderMap, ResponseSink) -> BoxFuture<'static, Result<(), Status>> + Send + Sync,
>;
type BidiErasedFn = Arc<
    dyn Fn(MessageStream, HeaderMap, ResponseSink) -> BoxFuture<'static, Result<(), Status>>
        + Send
        + Sync,
>;

/// The shape-specific, type-erased implementation behind a [`Handler`].
#[derive(Clone)]
pub enum HandlerFn {
    Unary(UnaryErasedFn),
    ClientStreaming(ClientStreamErasedFn),
    ServerStreaming(ServerStreamErasedFn),
    Bidi(BidiErasedFn),
}

/// An immutable, registered method handler (design §3 "Method Handler").
///
/// Once built, a `Handler` is cheap to clone (an `Arc` around the erased
/// function) and is never mutated; registration either installs a new
/// one or fails, it never overwrites one in place (design §4.1).
#[derive(Clone)]
pub struct Handler {
    pub path: String,
    pub shape: Shape,
    pub func: HandlerFn,
}

impl Handler {
    /// Builds a unary handler, folding `deserialize`/`serialize` into the
    /// erased closure stored in the registry.
    pub fn unary<Req, Res, F, Fut>(
        path: impl Into<String>,
        deserialize: impl Fn(Bytes) -> Result<Req, Status> + Send + Sync + 'static,
        serialize: impl Fn(Res) -> Result<Bytes, Status> + Send + Sync + 'static,
        func: F,
    ) -> Handler
    where
        F: Fn(Req, HeaderMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Status>> + Send + 'static,
    {
        let func = Arc::new(func);
        let deserialize = Arc::new(deserialize);
        let serialize = Arc::new(serialize);
        let erased: UnaryErasedFn = Arc::new(move |bytes, metadata| {
            let func = func.clone();
            let deserialize = deserialize.clone();
            let serialize = serialize.clone();
            Box::pin(async move {
                let request = deserialize(bytes)?;
                let response = func(request, metadata).await?;
                serialize(response)
            })
        });
        Handler {
            path: path.into(),
            shape: Shape::Unary,
            func: HandlerFn::Unary(erased),
        }
    }

    /// Builds a client-streaming handler: the caller sees a stream of
    /// deserialized requests and returns a single response.
    pub fn client_streaming<Req, Res, F, Fut>(
        path: impl Into<String>,
        deserialize: impl Fn(Bytes) -> Result<Req, Status> + Send + Sync + 'static,
        serialize: impl Fn(Res) -> Result<Bytes, Status> + Send + Sync + 'static,
        func: F,
    ) -> Handler
    where
        Req: Send + 'static,
        F: Fn(Pin<Box<dyn futures_core::Stream<Item = Result<Req, Status>> + Send>>, HeaderMap) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<Res, Status>> + Send + 'static,
    {
        use tokio_stream::StreamExt;

        let func = Arc::new(func);
        let deserialize = Arc::new(deserialize);
        let serialize = Arc::new(serialize);
        let erased: ClientStreamErasedFn = Arc::new(move |raw_stream, metadata| {
            let func = func.clone();
            let deserialize = deserialize.clone();
            let serialize = serialize.clone();
            Box::pin(async move {
                let deserialize2 = deserialize.clone();
                let typed_stream = raw_stream.map(move |item| item.and_then(|b| deserialize2(b)));
                let response = func(Box::pin(typed_stream), metadata).await?;
                serialize(response)
            })
        });
        Handler {
            path: path.into(),
            shape: Shape::ClientStreaming,
            func: HandlerFn::ClientStreaming(erased),
        }
    }

    /// Builds a server-streaming handler: a single deserialized request,
    /// zero or more serialized responses pushed through a [`ResponseSink`].
    pub fn server_streaming<Req, F, Fut>(
        path: impl Into<String>,
        deserialize: impl Fn(Bytes) -> Result<Req, Status> + Send + Sync + 'static,
        func: F,
    ) -> Handler
    where
        F: Fn(Req, HeaderMap, ResponseSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let func = Arc::new(func);
        let deserialize = Arc::new(deserialize);
        let erased: ServerStreamErasedFn = Arc::new(move |bytes, metadata, sink| {
            let func = func.clone();
            let deserialize = deserialize.clone();
            Box::pin(async move {
                let request = deserialize(bytes)?;
                func(request, metadata, sink).await
            })
        });
        Handler {
            path: path.into(),
            shape: Shape::ServerStreaming,
            func: HandlerFn::ServerStreaming(erased),
        }
    }

    /// Builds a bidi handler: a stream of deserialized requests in, zero
    /// or more serialized responses out through a [`ResponseSink`].
    pub fn bidi<Req, F, Fut>(
        path: impl Into<String>,
        deserialize: impl Fn(Bytes) -> Result<Req, Status> + Send + Sync + 'static,
        func: F,
    ) -> Handler
    where
        Req: Send + 'static,
        F: Fn(Pin<Box<dyn futures_core::Stream<Item = Result<Req, Status>> + Send>>, HeaderMap, ResponseSink) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        use tokio_stream::StreamExt;

        let func = Arc::new(func);
        let deserialize = Arc::new(deserialize);
        let erased: BidiErasedFn = Arc::new(move |raw_stream, metadata, sink| {
            let func = func.clone();
            let deserialize = deserialize.clone();
            Box::pin(async move {
                let deserialize2 = deserialize.clone();
                let typed_stream = raw_stream.map(move |item| item.and_then(|b| deserialize2(b)));
                func(Box::pin(typed_stream), metadata, sink).await
            })
        });
        Handler {
            path: path.into(),
            shape: Shape::Bidi,
            func: HandlerFn::Bidi(erased),
        }
    }
}

/// A single method entry in a [`ServiceDefinition`], mirroring design
/// §3's "Service Definition (input)".
pub struct MethodDefinition {
    pub name: String,
    pub original_name: Option<String>,
    pub request_stream: bool,
    pub response_stream: bool,
    pub handler_factory: Box<dyn FnOnce(String) -> Handler + Send>,
}

/// A mapping from method name to its wire path and streaming shape, plus
/// a factory that builds the erased [`Handler`] once an implementation
/// (or the `addService` default-unimplemented fallback) is chosen.
pub struct ServiceDefinition {
    pub methods: Vec<MethodDefinition>,
}

impl ServiceDefinition {
    pub fn new() -> Self {
        ServiceDefinition { methods: Vec::new() }
    }

    pub fn method(mut self, def: MethodDefinition) -> Self {
        self.methods.push(def);
        self
    }
}

impl Default for ServiceDefinition {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(bytes: Bytes) -> Result<Bytes, Status> {
        Ok(bytes)
    }

    #[tokio::test]
    async fn unary_handler_round_trips_through_erased_closure() {
        let handler = Handler::unary(
            "/demo.S/Echo",
            identity,
            identity,
            |req: Bytes, _meta| async move { Ok::<Bytes, Status>(req) },
        );

        let HandlerFn::Unary(f) = handler.func.clone() else {
            panic!("expected unary handler");
        };
        let response = f(Bytes::from_static(b"hi"), HeaderMap::new()).await.unwrap();
        assert_eq!(response, Bytes::from_static(b"hi"));
    }

    #[test]
    fn shape_derivation_matches_streaming_flags() {
        assert_eq!(Shape::from_streaming_flags(false, false), Shape::Unary);
        assert_eq!(Shape::from_streaming_flags(true, false), Shape::ClientStreaming);
        assert_eq!(Shape::from_streaming_flags(false, true), Shape::ServerStreaming);
        assert_eq!(Shape::from_streaming_flags(true, true), Shape::Bidi);
    }
}
