//! Maps a request's service type to the handler registered for it via `addRequestHandler`.
//!
//! The transport layer treats a message body as opaque bytes; the one exception is the small
//! numeric type identifier every encoded service body leads with in the real protocol (the
//! `NodeId` of its `ExtensionObject` wrapper), which this layer reads just far enough to route
//! the body to the right handler without decoding anything past that.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::dispatch::RequestHandler;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<u32, Arc<dyn RequestHandler>>>,
    default: RwLock<Option<Arc<dyn RequestHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            default: RwLock::new(None),
        }
    }

    /// Register `handler` for requests whose leading type identifier is `type_id`.
    pub fn register(&self, type_id: u32, handler: Arc<dyn RequestHandler>) {
        self.handlers.write().insert(type_id, handler);
    }

    /// Register a catch-all handler used when a request's type has no specific registration,
    /// e.g. a discovery-capable handler answering `GetEndpoints` on any unrecognised type.
    pub fn set_default(&self, handler: Arc<dyn RequestHandler>) {
        *self.default.write() = Some(handler);
    }

    pub fn get(&self, type_id: u32) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.read().get(&type_id).cloned()
    }

    pub fn default_handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.default.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, _request_handle: u32, body: Vec<u8>) -> Vec<u8> {
            body
        }
    }

    #[test]
    fn a_registered_type_id_resolves_to_its_handler() {
        let registry = HandlerRegistry::new();
        registry.register(42, Arc::new(Echo));
        assert!(registry.get(42).is_some());
        assert!(registry.get(7).is_none());
    }

    #[test]
    fn an_unregistered_type_falls_back_to_the_default_handler() {
        let registry = HandlerRegistry::new();
        registry.set_default(Arc::new(Echo));
        assert!(registry.get(99).is_none());
        assert!(registry.default_handler().is_some());
    }
}
