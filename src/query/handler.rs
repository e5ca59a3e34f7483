//! Query handler registration: zero or more handlers per `(queryName,
//! resultType)` pair.
//!
//! Unlike the Command registry, several handlers may be registered for the
//! same `(queryName, resultType)` pair — the server fans a routed query out
//! to every one of them and the channel emits one `QueryResponse` per
//! handler followed by a single `QueryComplete`. Subscribe/Unsubscribe
//! traffic is keyed by that pair, not by handler identity: only the first
//! registration for a pair sends a Subscribe, and only the removal that
//! empties a pair sends an Unsubscribe.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::wire::query::Query;

/// An error raised by a user-registered query handler. Converted into a
/// `QueryResponse` carrying an error code rather than treated as a
/// transport failure.
#[derive(Debug, Clone)]
pub struct HandlerError {
    /// A human-readable description of the failure.
    pub message: String,
}

impl HandlerError {
    /// Builds a handler error with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// User-supplied logic for answering one `(queryName, resultType)` pair.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Produces the response payload for `query`, or a [`HandlerError`] to
    /// be converted into an error-carrying `QueryResponse`.
    async fn handle(&self, query: Query) -> Result<Vec<u8>, HandlerError>;
}

#[async_trait]
impl<F, Fut> QueryHandler for F
where
    F: Fn(Query) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Vec<u8>, HandlerError>> + Send,
{
    async fn handle(&self, query: Query) -> Result<Vec<u8>, HandlerError> {
        (self)(query).await
    }
}

type QueryKey = (String, String);

/// Zero-or-more handlers per `(queryName, resultType)` pair. First
/// registration for a pair signals "now interesting" (caller should
/// Subscribe); the removal leaving the pair empty signals "no longer
/// interesting" (caller should Unsubscribe).
#[derive(Default)]
pub struct QueryHandlerRegistry {
    inner: Mutex<HashMap<QueryKey, Vec<Arc<dyn QueryHandler>>>>,
}

impl QueryHandlerRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handler` under `(query_name, result_name)`. Returns `true` iff
    /// this is the first handler registered for the pair.
    pub fn add(&self, query_name: &str, result_name: &str, handler: Arc<dyn QueryHandler>) -> bool {
        let mut guard = self.inner.lock();
        let entry = guard
            .entry((query_name.to_string(), result_name.to_string()))
            .or_default();
        let was_empty = entry.is_empty();
        entry.push(handler);
        was_empty
    }

    /// Removes one registration of `handler` from `(query_name,
    /// result_name)`, by identity. Returns `true` iff this removal leaves
    /// the pair with no handlers left.
    pub fn remove(&self, query_name: &str, result_name: &str, handler: &Arc<dyn QueryHandler>) -> bool {
        let key = (query_name.to_string(), result_name.to_string());
        let mut guard = self.inner.lock();
        let Some(entry) = guard.get_mut(&key) else {
            return false;
        };
        let Some(position) = entry.iter().position(|h| Arc::ptr_eq(h, handler)) else {
            return false;
        };
        entry.remove(position);
        if entry.is_empty() {
            guard.remove(&key);
            true
        } else {
            false
        }
    }

    /// Every handler currently registered for `(query_name, result_name)`,
    /// in registration order — one `QueryResponse` is emitted per entry.
    #[must_use]
    pub fn get(&self, query_name: &str, result_name: &str) -> Vec<Arc<dyn QueryHandler>> {
        self.inner
            .lock()
            .get(&(query_name.to_string(), result_name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Every `(queryName, resultType)` pair with at least one handler, used
    /// to replay Subscribe frames after reconnect.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueryKey> {
        self.inner.lock().keys().cloned().collect()
    }

    /// Drops every registration without sending any wire traffic (used by
    /// `disconnect`, which clears local state unconditionally).
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
