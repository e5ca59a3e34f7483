//! Subscription-query sessions: consumer and provider sides of a
//! subscription query.
//!
//! Two distinct roles share the name "subscription query" and are modeled
//! separately here:
//!
//! - [`SubscriptionQuerySession`] is the consumer side returned to caller
//!   code by `QueryChannel::subscription_query`: it owns the dedicated
//!   `Query.subscription` RPC for one subscription id, lazily fetches the
//!   initial result, and exposes the update stream.
//! - [`ProviderSubscription`] is the provider side: bookkeeping the query
//!   channel keeps per `subscriptionId` when a *peer's* subscription query
//!   is routed to one of this client's registered handlers on the shared
//!   control stream.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, OnceCell};

use crate::error::ConnectorError;
use crate::buffered_stream::BufferedResultStream;
use crate::outbound::OutboundSink;
use crate::wire::query;

/// Lifecycle state of one subscription-query session, from either side.
/// Peer-initiated completion and caller-initiated cancel both converge on
/// `Cancelled`/`Completed` — there is no path back out of either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Subscribe has been sent (or received); no result observed yet.
    AwaitingAck,
    /// At least the initial result or one update has been delivered.
    Streaming,
    /// The server (or, provider-side, this client) signalled normal
    /// completion.
    Completed,
    /// Cancelled by the caller, or torn down with the transport.
    Cancelled,
}

/// The consumer-side handle for one subscription query: lazily fetches the
/// initial result and exposes the update stream.
pub struct SubscriptionQuerySession {
    subscription_id: String,
    query: query::Query,
    sink: Arc<dyn OutboundSink<query::SubscriptionQueryRequest>>,
    initial_result: OnceCell<Result<Vec<u8>, ConnectorError>>,
    initial_result_rx: Mutex<Option<oneshot::Receiver<Result<Vec<u8>, ConnectorError>>>>,
    updates: Mutex<Option<BufferedResultStream<Vec<u8>>>>,
    state: Mutex<SubscriptionState>,
}

impl SubscriptionQuerySession {
    /// Builds a session bound to an already-open subscription RPC. Callers
    /// should use `QueryChannel::subscription_query`, which wires the
    /// background frame-forwarding task this session's [`Self::initial_result`]
    /// and update stream rely on.
    pub(super) fn new(
        subscription_id: String,
        query: query::Query,
        sink: Arc<dyn OutboundSink<query::SubscriptionQueryRequest>>,
        initial_result_rx: oneshot::Receiver<Result<Vec<u8>, ConnectorError>>,
        updates: BufferedResultStream<Vec<u8>>,
    ) -> Self {
        Self {
            subscription_id,
            query,
            sink,
            initial_result: OnceCell::new(),
            initial_result_rx: Mutex::new(Some(initial_result_rx)),
            updates: Mutex::new(Some(updates)),
            state: Mutex::new(SubscriptionState::AwaitingAck),
        }
    }

    /// This session's subscription id.
    #[must_use]
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// The initial result, requested from the server on first call and
    /// cached thereafter — an idempotent, at-most-once request regardless
    /// of how many times this is awaited.
    pub async fn initial_result(&self) -> Result<Vec<u8>, ConnectorError> {
        let result = self
            .initial_result
            .get_or_init(|| async {
                let request = query::SubscriptionQueryRequest::GetInitialResult {
                    subscription_id: self.subscription_id.clone(),
                    query: self.query.clone(),
                };
                if let Err(error) = self.sink.send(request).await {
                    return Err(error);
                }
                let rx = self
                    .initial_result_rx
                    .lock()
                    .take()
                    .expect("entered exactly once under OnceCell::get_or_init");
                rx.await.unwrap_or(Err(ConnectorError::Disconnected))
            })
            .await;
        *self.state.lock() = SubscriptionState::Streaming;
        result.clone()
    }

    /// Takes ownership of the update stream. Panics if called more than
    /// once — callers are expected to hold onto the returned stream.
    pub fn updates(&self) -> BufferedResultStream<Vec<u8>> {
        self.updates
            .lock()
            .take()
            .expect("updates() already taken for this session")
    }

    /// The session's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    /// Cancels the subscription: sends Unsubscribe and marks the session
    /// `Cancelled`. Idempotent.
    pub async fn cancel(&self) -> Result<(), ConnectorError> {
        let mut state = self.state.lock();
        if *state == SubscriptionState::Cancelled {
            return Ok(());
        }
        *state = SubscriptionState::Cancelled;
        drop(state);
        self.sink
            .send(query::SubscriptionQueryRequest::Unsubscribe {
                subscription_id: self.subscription_id.clone(),
            })
            .await
    }
}

/// Provider-side bookkeeping: tracks one peer-initiated subscription this
/// client is serving through a registered handler, so a late response isn't
/// sent after the peer unsubscribes.
pub struct ProviderSubscription {
    state: Mutex<SubscriptionState>,
}

impl ProviderSubscription {
    /// Builds a fresh provider-side record in `AwaitingAck`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SubscriptionState::AwaitingAck),
        }
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    /// Whether responses may still be sent for this subscription.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(
            self.state(),
            SubscriptionState::Completed | SubscriptionState::Cancelled
        )
    }

    /// Transitions to `Streaming`, iff still active. Returns whether the
    /// transition took effect.
    pub fn mark_streaming(&self) -> bool {
        let mut guard = self.state.lock();
        if matches!(*guard, SubscriptionState::Completed | SubscriptionState::Cancelled) {
            return false;
        }
        *guard = SubscriptionState::Streaming;
        true
    }

    /// Transitions to `Completed`.
    pub fn mark_completed(&self) {
        *self.state.lock() = SubscriptionState::Completed;
    }

    /// Transitions to `Cancelled`.
    pub fn cancel(&self) {
        *self.state.lock() = SubscriptionState::Cancelled;
    }
}

impl Default for ProviderSubscription {
    fn default() -> Self {
        Self::new()
    }
}
