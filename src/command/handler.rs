//! Command handler registration: one handler per command name, silent
//! replace on re-registration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::wire::command::Command;

/// An error raised by a user-registered command handler. Converted into a
/// `COMMAND_EXECUTION_ERROR` response rather than treated as a transport
/// failure.
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

/// User-supplied logic for handling one command name.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Produces the response payload for `command`, or a [`HandlerError`]
    /// to be converted into a `COMMAND_EXECUTION_ERROR` response.
    async fn handle(&self, command: Command) -> Result<Vec<u8>, HandlerError>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Command) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Vec<u8>, HandlerError>> + Send,
{
    async fn handle(&self, command: Command) -> Result<Vec<u8>, HandlerError> {
        (self)(command).await
    }
}

struct Registered {
    handler: Arc<dyn CommandHandler>,
    load_factor: u32,
}

/// Exactly one handler per command name; re-registering replaces silently
/// on the client (the server's view converges via paired Subscribe/
/// Unsubscribe traffic the channel sends around each change).
#[derive(Default)]
pub struct CommandHandlerRegistry {
    inner: Mutex<HashMap<String, Registered>>,
}

impl CommandHandlerRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or silently replaces) the handler for `name`.
    pub fn set(&self, name: &str, handler: Arc<dyn CommandHandler>, load_factor: u32) {
        self.inner
            .lock()
            .insert(name.to_string(), Registered { handler, load_factor });
    }

    /// The handler currently registered for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.inner.lock().get(name).map(|r| r.handler.clone())
    }

    /// Removes `name` iff the handler currently registered there is, by
    /// identity, `expected` — so a cancel racing a later re-registration
    /// for the same name never clobbers the newer handler.
    pub fn remove_if_current(&self, name: &str, expected: &Arc<dyn CommandHandler>) -> bool {
        let mut guard = self.inner.lock();
        let still_current = guard
            .get(name)
            .is_some_and(|entry| Arc::ptr_eq(&entry.handler, expected));
        if still_current {
            let _ = guard.remove(name);
        }
        still_current
    }

    /// All currently registered `(name, load_factor)` pairs, used to replay
    /// Subscribe frames after reconnect.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, u32)> {
        self.inner
            .lock()
            .iter()
            .map(|(name, r)| (name.clone(), r.load_factor))
            .collect()
    }

    /// Drops every registration without sending any wire traffic (used by
    /// `disconnect`, which clears local state unconditionally).
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
