//! Lock-free handler registry using `scc::HashMap`.
//!
//! Maps an operation name to an *ordered* list of async handlers. Order is
//! registration order: when a request comes in, every handler for the name
//! runs sequentially and the last return value becomes the reply payload.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::envelope::Envelope;
use crate::pending::CallResult;

/// Boxed future returned by a handler.
pub type HandlerFuture = BoxFuture<'static, CallResult>;

/// A registered handler: receives the request payload and the full envelope,
/// returns an optional reply payload or an error.
pub type Handler = Arc<dyn Fn(Option<Value>, Envelope) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Option<Value>, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    Arc::new(move |payload, envelope| Box::pin(f(payload, envelope)))
}

/// Lock-free store of named handler lists.
pub struct HandlerRegistry {
    handlers: scc::HashMap<String, Vec<Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: scc::HashMap::new(),
        }
    }

    /// Append a handler to the name's list, creating the list if needed.
    pub fn add(&self, name: &str, handler: Handler) {
        if self
            .handlers
            .update_sync(name, |_, list| list.push(handler.clone()))
            .is_some()
        {
            return;
        }

        // Insert; if another thread beat us, append to their list
        if let Err((name, mut list)) = self.handlers.insert_sync(name.to_string(), vec![handler])
            && let Some(handler) = list.pop()
        {
            let _ = self
                .handlers
                .update_sync(&name, |_, existing| existing.push(handler));
        }
    }

    /// The handlers registered for `name`, in registration order.
    pub fn handlers_for(&self, name: &str) -> Vec<Handler> {
        self.handlers
            .read_sync(name, |_, list| list.clone())
            .unwrap_or_default()
    }

    /// Remove every handler for `name`.
    ///
    /// Returns `true` if the name had any handlers.
    pub fn forget(&self, name: &str) -> bool {
        self.handlers.remove_sync(name).is_some()
    }

    /// Number of handlers registered for `name`.
    pub fn count_for(&self, name: &str) -> usize {
        self.handlers
            .read_sync(name, |_, list| list.len())
            .unwrap_or(0)
    }

    /// All names with at least one handler.
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.handlers.retain_sync(|name, _| {
            names.push(name.clone());
            true
        });
        names
    }

    /// Number of names with at least one handler.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Remove every handler for every name.
    pub fn clear(&self) {
        self.handlers.clear_sync();
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn echo() -> Handler {
        handler_fn(|payload, _| async move { Ok(payload) })
    }

    #[test]
    fn test_add_and_count() {
        let registry = HandlerRegistry::new();
        registry.add("echo", echo());
        registry.add("echo", echo());
        registry.add("other", echo());

        assert_eq!(registry.count_for("echo"), 2);
        assert_eq!(registry.count_for("other"), 1);
        assert_eq!(registry.count_for("missing"), 0);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_forget() {
        let registry = HandlerRegistry::new();
        registry.add("echo", echo());

        assert!(registry.forget("echo"));
        assert!(!registry.forget("echo"));
        assert!(registry.handlers_for("echo").is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_names_and_clear() {
        let registry = HandlerRegistry::new();
        registry.add("a", echo());
        registry.add("b", echo());

        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let registry = HandlerRegistry::new();
        registry.add("op", handler_fn(|_, _| async { Ok(Some(json!("first"))) }));
        registry.add("op", handler_fn(|_, _| async { Ok(Some(json!("second"))) }));

        let envelope = Envelope::request("app", "op", "a", None, None);
        let mut last = None;
        for handler in registry.handlers_for("op") {
            last = handler(None, envelope.clone()).await.unwrap();
        }
        assert_eq!(last, Some(json!("second")));
    }

    #[tokio::test]
    async fn test_handler_fn_passes_payload_and_envelope() {
        let handler = handler_fn(|payload, envelope: Envelope| async move {
            Ok(Some(json!({ "payload": payload, "name": envelope.name })))
        });

        let envelope = Envelope::request("app", "inspect", "a", None, Some(json!(7)));
        let out = handler(envelope.payload.clone(), envelope).await.unwrap();
        assert_eq!(out, Some(json!({ "payload": 7, "name": "inspect" })));
    }
}
