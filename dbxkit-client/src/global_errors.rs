// Observers that see the error of every request, whatever its route.

use dashmap::DashMap;
use dbxkit_core::{CallError, Executor};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Route errors arrive as raw JSON since observers don't know the route.
pub type GlobalErrorHandler = Arc<dyn Fn(CallError<Value>) + Send + Sync>;

/// Returned by [`GlobalErrorHandlers::register`]; use it to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorHandlerKey(u64);

struct Registration {
    executor: Arc<dyn Executor>,
    handler: GlobalErrorHandler,
}

/// Called in addition to each request's own handler, e.g. to sign the user
/// out on an auth error. Share one instance between clients to observe them all.
#[derive(Default)]
pub struct GlobalErrorHandlers {
    handlers: DashMap<ErrorHandlerKey, Registration>,
    next_key: AtomicU64,
}

impl GlobalErrorHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        executor: Arc<dyn Executor>,
        handler: impl Fn(CallError<Value>) + Send + Sync + 'static,
    ) -> ErrorHandlerKey {
        let key = ErrorHandlerKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        self.handlers.insert(
            key,
            Registration {
                executor,
                handler: Arc::new(handler),
            },
        );
        debug!(key = key.0, "Registered global error handler");
        key
    }

    /// Returns whether a handler was registered under `key`.
    pub fn deregister(&self, key: ErrorHandlerKey) -> bool {
        self.handlers.remove(&key).is_some()
    }

    pub fn deregister_all(&self) {
        self.handlers.clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn report(&self, error: &CallError<Value>) {
        // Collected first so no handler runs under a map shard lock.
        let targets: Vec<(Arc<dyn Executor>, GlobalErrorHandler)> = self
            .handlers
            .iter()
            .map(|entry| (Arc::clone(&entry.executor), Arc::clone(&entry.handler)))
            .collect();
        trace!(handlers = targets.len(), error = %error, "Reporting error to global handlers");
        for (executor, handler) in targets {
            let error = error.clone();
            executor.execute(Box::new(move || handler(error)));
        }
    }
}

impl fmt::Debug for GlobalErrorHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalErrorHandlers")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbxkit_core::{ApiErrorDetails, ClientError, Inline, LocalizedUserMessage};
    use serde_json::json;
    use std::sync::mpsc;

    fn auth_error() -> CallError<Value> {
        CallError::AuthError(ApiErrorDetails {
            error: json!({".tag": "expired_access_token"}),
            user_message: Some(LocalizedUserMessage {
                text: "ábc".to_string(),
                locale: "EN-US".to_string(),
            }),
            error_summary: Some("expired_access_token/".to_string()),
            request_id: Some("def".to_string()),
        })
    }

    #[test]
    fn test_registered_handlers_see_each_report() {
        let handlers = GlobalErrorHandlers::new();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        handlers.register(Arc::new(Inline), move |e| tx.send(("first", e)).unwrap());
        handlers.register(Arc::new(Inline), move |e| tx2.send(("second", e)).unwrap());

        handlers.report(&auth_error());
        let mut seen: Vec<_> = rx.try_iter().collect();
        seen.sort_by_key(|(name, _)| *name);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("first", auth_error()));
        assert_eq!(seen[1].1.request_id(), Some("def"));
    }

    #[test]
    fn test_deregister_stops_delivery() {
        let handlers = GlobalErrorHandlers::new();
        let (tx, rx) = mpsc::channel::<CallError<Value>>();
        let key = handlers.register(Arc::new(Inline), move |e| tx.send(e).unwrap());

        assert!(handlers.deregister(key));
        assert!(!handlers.deregister(key));
        handlers.report(&auth_error());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_deregister_all() {
        let handlers = GlobalErrorHandlers::new();
        let (tx, rx) = mpsc::channel::<CallError<Value>>();
        let tx2 = tx.clone();
        handlers.register(Arc::new(Inline), move |e| tx.send(e).unwrap());
        handlers.register(Arc::new(Inline), move |e| tx2.send(e).unwrap());
        assert_eq!(handlers.len(), 2);

        handlers.deregister_all();
        assert!(handlers.is_empty());
        handlers.report(&CallError::ClientError(ClientError::UnexpectedState));
        assert!(rx.try_recv().is_err());
    }
}
