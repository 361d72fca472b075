//! Handler Registry (design §4.1): maps a wire path to an immutable
//! [`Handler`], protected by an `RwLock` since lookups vastly outnumber
//! registrations once a server has started handling traffic.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Result, ServerError};
use crate::handler::{Handler, MethodDefinition, ServiceDefinition};
use crate::status::Status;

/// Process-visible table of registered method handlers.
///
/// Cheap to clone (an `Arc` around the shared map); the Dispatch Core and
/// the Server Facade each hold a clone rather than sharing a reference.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<RwLock<HashMap<String, Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a single handler at `path`. Fails if a handler is
    /// already registered there; registration never silently replaces
    /// an existing entry (design §4.1 "duplicate registration").
    pub fn register(&self, handler: Handler) -> Result<()> {
        let mut map = self.inner.write().unwrap();
        if map.contains_key(&handler.path) {
            return Err(ServerError::InvalidArgument(format!(
                "a handler is already registered for {}",
                handler.path
            )));
        }
        map.insert(handler.path.clone(), handler);
        Ok(())
    }

    pub fn unregister(&self, path: &str) {
        self.inner.write().unwrap().remove(path);
    }

    pub fn lookup(&self, path: &str) -> Option<Handler> {
        self.inner.read().unwrap().get(path).cloned()
    }

    /// Registers every method of a [`ServiceDefinition`] under
    /// `/{service_name}/{method_name}`. All-or-nothing: if any method
    /// path collides with an existing registration, no method from this
    /// service is installed (design §4.1 "addService validates the whole
    /// service before registering any of it").
    pub fn add_service(&self, service_name: &str, definition: ServiceDefinition) -> Result<()> {
        let mut map = self.inner.write().unwrap();

        let mut paths = Vec::with_capacity(definition.methods.len());
        for method in &definition.methods {
            let path = format!("/{service_name}/{}", method.name);
            if map.contains_key(&path) {
                return Err(ServerError::InvalidArgument(format!(
                    "a handler is already registered for {path}"
                )));
            }
            paths.push(path);
        }

        for (path, method) in paths.into_iter().zip(definition.methods.into_iter()) {
            let MethodDefinition { handler_factory, .. } = method;
            let handler = handler_factory(path.clone());
            map.insert(path, handler);
        }
        Ok(())
    }

    /// Removes every method of `service_name` that this registry
    /// currently has installed under it, matching whatever path prefix
    /// `add_service` would have used.
    pub fn remove_service(&self, service_name: &str) {
        let prefix = format!("/{service_name}/");
        self.inner
            .write()
            .unwrap()
            .retain(|path, _| !path.starts_with(&prefix));
    }

    /// Looks up `path`, returning the fixed-wording UNIMPLEMENTED status
    /// (design §4.4 step 2) when nothing is registered there.
    pub fn lookup_or_unimplemented(&self, path: &str) -> std::result::Result<Handler, Status> {
        self.lookup(path).ok_or_else(|| Status::unimplemented(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use bytes::Bytes;

    fn identity(bytes: Bytes) -> std::result::Result<Bytes, Status> {
        Ok(bytes)
    }

    fn echo_handler(path: &str) -> Handler {
        Handler::unary(path, identity, identity, |req: Bytes, _meta| async move {
            Ok::<Bytes, Status>(req)
        })
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = HandlerRegistry::new();
        registry.register(echo_handler("/demo.S/Echo")).unwrap();
        let err = registry.register(echo_handler("/demo.S/Echo")).unwrap_err();
        assert!(matches!(err, ServerError::InvalidArgument(_)));
    }

    #[test]
    fn lookup_missing_path_returns_unimplemented() {
        let registry = HandlerRegistry::new();
        let status = registry.lookup_or_unimplemented("/demo.S/Missing").unwrap_err();
        assert_eq!(status.code(), crate::status::Code::Unimplemented);
    }

    #[test]
    fn add_service_is_all_or_nothing_on_collision() {
        let registry = HandlerRegistry::new();
        registry.register(echo_handler("/demo.S/Echo")).unwrap();

        let definition = ServiceDefinition::new().method(MethodDefinition {
            name: "Echo".to_string(),
            original_name: None,
            request_stream: false,
            response_stream: false,
            handler_factory: Box::new(|path| echo_handler(&path)),
        });

        let err = registry.add_service("demo.S", definition).unwrap_err();
        assert!(matches!(err, ServerError::InvalidArgument(_)));
        // Unrelated method from the same failed batch must not appear.
        assert!(registry.lookup("/demo.S/Other").is_none());
    }

    #[test]
    fn remove_service_clears_only_its_own_prefix() {
        let registry = HandlerRegistry::new();
        registry.register(echo_handler("/demo.S/Echo")).unwrap();
        registry.register(echo_handler("/other.S/Echo")).unwrap();

        registry.remove_service("demo.S");

        assert!(registry.lookup("/demo.S/Echo").is_none());
        assert!(registry.lookup("/other.S/Echo").is_some());
    }
}
