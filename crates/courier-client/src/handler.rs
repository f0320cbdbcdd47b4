// Local handler surface: what the worker pool invokes for a routed
// request. Handlers are synchronous and run on the worker tasks; a handler
// that needs to wait should do its waiting before registering.
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

#[derive(thiserror::Error, Debug)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A registered handler for one routed name. Commands return at most one
/// payload; query handlers may be invoked once per registered handler with
/// each producing one payload.
pub trait LocalHandler: Send + Sync + 'static {
    fn handle(&self, payload: &Bytes) -> std::result::Result<Option<Bytes>, HandlerError>;
}

impl<F> LocalHandler for F
where
    F: Fn(&Bytes) -> std::result::Result<Option<Bytes>, HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, payload: &Bytes) -> std::result::Result<Option<Bytes>, HandlerError> {
        self(payload)
    }
}

/// Handlers indexed by routed name. Multiple handlers may share a name;
/// lookup order is registration order.
///
/// This is the buses' handler table, and it also works standalone:
/// [`InProcessHandlers::execute`] dispatches to a registered handler
/// directly, without a routing server in the loop.
#[derive(Default)]
pub struct InProcessHandlers {
    handlers: Mutex<HashMap<String, Vec<Arc<dyn LocalHandler>>>>,
}

impl InProcessHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn LocalHandler>) {
        let mut handlers = self.handlers.lock().expect("handler lock poisoned");
        handlers.entry(name.into()).or_default().push(handler);
    }

    /// Remove one handler instance by pointer identity.
    pub fn unregister(&self, name: &str, handler: &Arc<dyn LocalHandler>) {
        let mut handlers = self.handlers.lock().expect("handler lock poisoned");
        if let Some(list) = handlers.get_mut(name) {
            if let Some(index) = list.iter().position(|h| Arc::ptr_eq(h, handler)) {
                list.remove(index);
            }
            if list.is_empty() {
                handlers.remove(name);
            }
        }
    }

    /// Invoke the first handler registered for `name` directly.
    pub fn execute(&self, name: &str, payload: &Bytes) -> Result<Option<Bytes>> {
        let handler = self
            .handlers_for(name)
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoHandler(name.to_string()))?;
        handler.handle(payload).map_err(|err| Error::Remote {
            code: crate::error::error_codes::EXECUTION_ERROR.to_string(),
            message: err.message,
        })
    }

    pub(crate) fn handlers_for(&self, name: &str) -> Vec<Arc<dyn LocalHandler>> {
        let handlers = self.handlers.lock().expect("handler lock poisoned");
        handlers.get(name).cloned().unwrap_or_default()
    }

    pub(crate) fn clear(&self) {
        let mut handlers = self.handlers.lock().expect("handler lock poisoned");
        handlers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handlers_invoked_in_registration_order() {
        let registry = InProcessHandlers::new();
        registry.register(
            "q",
            Arc::new(|_: &Bytes| -> std::result::Result<Option<Bytes>, HandlerError> {
                Ok(Some(Bytes::from_static(b"first")))
            }),
        );
        registry.register(
            "q",
            Arc::new(|_: &Bytes| -> std::result::Result<Option<Bytes>, HandlerError> {
                Ok(Some(Bytes::from_static(b"second")))
            }),
        );
        let results: Vec<_> = registry
            .handlers_for("q")
            .iter()
            .map(|h| h.handle(&Bytes::new()).expect("ok").expect("payload"))
            .collect();
        assert_eq!(
            results,
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );
    }

    #[test]
    fn unregister_drops_only_the_given_instance() {
        let registry = InProcessHandlers::new();
        let keep: Arc<dyn LocalHandler> =
            Arc::new(|_: &Bytes| -> std::result::Result<Option<Bytes>, HandlerError> { Ok(None) });
        let drop_me: Arc<dyn LocalHandler> =
            Arc::new(|_: &Bytes| -> std::result::Result<Option<Bytes>, HandlerError> { Ok(None) });
        registry.register("c", Arc::clone(&keep));
        registry.register("c", Arc::clone(&drop_me));
        registry.unregister("c", &drop_me);
        assert_eq!(registry.handlers_for("c").len(), 1);
        registry.unregister("c", &keep);
        assert!(registry.handlers_for("c").is_empty());
    }

    #[test]
    fn execute_dispatches_without_a_server() {
        let registry = InProcessHandlers::new();
        registry.register(
            "greet",
            Arc::new(|payload: &Bytes| -> std::result::Result<Option<Bytes>, HandlerError> {
                let mut out = b"hello ".to_vec();
                out.extend_from_slice(payload);
                Ok(Some(Bytes::from(out)))
            }),
        );
        let result = registry
            .execute("greet", &Bytes::from_static(b"world"))
            .expect("ok");
        assert_eq!(result, Some(Bytes::from_static(b"hello world")));
        assert!(matches!(
            registry.execute("missing", &Bytes::new()),
            Err(Error::NoHandler(_))
        ));
    }

    #[test]
    fn handler_errors_surface_as_remote_failures() {
        let registry = InProcessHandlers::new();
        registry.register(
            "flaky",
            Arc::new(|_: &Bytes| -> std::result::Result<Option<Bytes>, HandlerError> {
                Err(HandlerError::new("nope"))
            }),
        );
        match registry.execute("flaky", &Bytes::new()) {
            Err(Error::Remote { message, .. }) => assert_eq!(message, "nope"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
