//! Packet processors and their registry.

use crate::connection::Connection;
use crate::error::CoreError;
use crate::registry::ConnectionRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use wirebus_protocol::Payload;

/// Context handed to a processor for one dispatch.
///
/// Carries the originating connection explicitly so a handler can address
/// out-of-band replies without relying on ambient task state.
#[derive(Clone)]
pub struct DispatchContext {
    registry: Option<Arc<ConnectionRegistry>>,
    connection_id: String,
}

impl DispatchContext {
    pub fn new(registry: Option<Arc<ConnectionRegistry>>, connection_id: impl Into<String>) -> Self {
        Self {
            registry,
            connection_id: connection_id.into(),
        }
    }

    /// Id of the connection the packet arrived on.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// The originating connection, when it is still registered.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.registry.as_ref()?.get(&self.connection_id)
    }

    /// The registry, when dispatching server-side.
    pub fn registry(&self) -> Option<&Arc<ConnectionRegistry>> {
        self.registry.as_ref()
    }
}

/// A registered packet handler.
pub trait Processor: Send + Sync {
    /// Routing key this processor answers to.
    fn identifier(&self) -> &str;

    /// Handles one packet. Returning `Some` produces a response packet on
    /// pools configured to send them.
    fn handle(
        &self,
        ctx: &DispatchContext,
        request_id: &str,
        method: &str,
        payload: &Payload,
    ) -> Result<Option<Payload>, CoreError>;
}

/// Processor lookup table, populated once at startup.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a processor under its identifier.
    pub fn register(&mut self, processor: Arc<dyn Processor>) {
        let id = processor.identifier().to_string();
        if self.processors.insert(id.clone(), processor).is_some() {
            tracing::warn!("processor '{}' registered twice, keeping the newer one", id);
        }
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<dyn Processor>> {
        self.processors.get(identifier).cloned()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl Processor for Echo {
        fn identifier(&self) -> &str {
            "echo"
        }

        fn handle(
            &self,
            _ctx: &DispatchContext,
            _request_id: &str,
            method: &str,
            payload: &Payload,
        ) -> Result<Option<Payload>, CoreError> {
            match method {
                "ping" => Ok(Some(payload.clone())),
                _ => Err(CoreError::Handler(format!("unknown method '{}'", method))),
            }
        }
    }

    #[test]
    fn test_register_and_dispatch() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(Echo));

        let processor = registry.get("echo").unwrap();
        let ctx = DispatchContext::new(None, "c-1");
        let result = processor
            .handle(&ctx, "1", "ping", &Payload::Value(json!("hi")))
            .unwrap();
        assert_eq!(result, Some(Payload::Value(json!("hi"))));
    }

    #[test]
    fn test_lookup_miss_is_reported_not_fatal() {
        let registry = ProcessorRegistry::new();
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_context_without_registry() {
        let ctx = DispatchContext::new(None, "c-1");
        assert_eq!(ctx.connection_id(), "c-1");
        assert!(ctx.connection().is_none());
        assert!(ctx.registry().is_none());
    }
}
