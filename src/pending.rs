//! The pending-instruction registry.
//!
//! Maps an outgoing instruction id to a completion the inbound ack stream
//! resolves. An id is in the registry iff a producer is awaiting its ack; a
//! terminal ack removes the entry exactly once; `fail_all` drains and fails
//! every remaining entry with a shared cause.

use crate::error::ConnectorError;
use crate::wire::AckOutcome;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

type AckResult = Result<(), ConnectorError>;

struct Pending {
    tx: oneshot::Sender<AckResult>,
}

/// Resolves when the tracked instruction is acked, or immediately if it was
/// fire-and-forget. Dropping the future without awaiting it simply abandons
/// the registry entry's receiver; `ack`/`fail_all` still run harmlessly.
pub struct PendingFuture {
    rx: oneshot::Receiver<AckResult>,
}

impl Future for PendingFuture {
    type Output = AckResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The sender side was dropped without resolving, which only
            // happens if the registry itself is torn down mid-flight.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ConnectorError::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Tracks outbound instructions awaiting a matching ack.
#[derive(Default)]
pub struct PendingInstructionRegistry {
    inner: Mutex<HashMap<String, Pending>>,
}

impl PendingInstructionRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `id`. An empty id is fire-and-forget: the returned
    /// future is already resolved with `Ok(())` and nothing is recorded.
    pub fn track(&self, id: &str) -> PendingFuture {
        let (tx, rx) = oneshot::channel();
        if id.is_empty() {
            let _ = tx.send(Ok(()));
        } else {
            let _ = self
                .inner
                .lock()
                .insert(id.to_string(), Pending { tx });
        }
        PendingFuture { rx }
    }

    /// Resolves the pending entry for `id` with `outcome`, removing it. A
    /// no-op if `id` is absent (duplicate/late ack, or an ack that raced
    /// ahead of the corresponding `track`).
    pub fn ack(&self, id: &str, outcome: AckOutcome) {
        let pending = self.inner.lock().remove(id);
        let Some(pending) = pending else {
            return;
        };
        let result = match outcome {
            AckOutcome::Success => Ok(()),
            AckOutcome::Failure(err) => Err(ConnectorError::from_server_error(id, err)),
        };
        let _ = pending.tx.send(result);
    }

    /// Drains every pending entry and fails each with `cause`.
    pub fn fail_all(&self, cause: &ConnectorError) {
        let drained: Vec<Pending> = self.inner.lock().drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.tx.send(Err(cause.clone()));
        }
    }

    /// Number of instructions currently awaiting an ack. Exposed for tests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().len()
    }
}
