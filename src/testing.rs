//! In-memory fakes for the transport seam, used by this crate's own tests.
//!
//! A small recorder that captures what was sent and lets the test script
//! what comes back, instead of standing up a real RPC server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::ConnectorError;
use crate::outbound::OutboundSink;
use crate::transport::{CommandTransport, QueryTransport};
use crate::wire::{command, query};

struct RecordingSink<F> {
    sent: Arc<Mutex<Vec<F>>>,
}

#[async_trait]
impl<F: Send + Sync + 'static> OutboundSink<F> for RecordingSink<F> {
    async fn send(&self, frame: F) -> Result<(), ConnectorError> {
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn close(&self) {}
}

/// A fake [`CommandTransport`]: records every outbound frame from
/// `open_stream`'s sink, lets the test feed inbound frames via
/// [`Self::push_inbound`] (routed to whichever `open_stream` call is
/// currently live, so reconnect scenarios just work), and returns queued
/// canned responses from [`Self::queue_dispatch_response`].
pub struct FakeCommandTransport {
    sent: Arc<Mutex<Vec<command::Outbound>>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Result<command::Inbound, ConnectorError>>>>,
    dispatched: Arc<Mutex<Vec<command::Command>>>,
    dispatch_responses: Mutex<VecDeque<Result<Option<command::CommandResponse>, ConnectorError>>>,
    open_stream_failures: Mutex<VecDeque<ConnectorError>>,
    open_stream_calls: AtomicUsize,
}

impl FakeCommandTransport {
    /// Builds a fake with no queued inbound frames or canned responses.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            inbound_tx: Mutex::new(None),
            dispatched: Arc::new(Mutex::new(Vec::new())),
            dispatch_responses: Mutex::new(VecDeque::new()),
            open_stream_failures: Mutex::new(VecDeque::new()),
            open_stream_calls: AtomicUsize::new(0),
        }
    }

    /// Every outbound frame sent on the currently installed sink, in order,
    /// across every `open_stream` call so far (reconnect included).
    #[must_use]
    pub fn sent_frames(&self) -> Vec<command::Outbound> {
        self.sent.lock().clone()
    }

    /// How many times `open_stream` has been called so far, for asserting a
    /// connect/reconnect loop did (or did not) attempt another connection.
    #[must_use]
    pub fn open_stream_call_count(&self) -> usize {
        self.open_stream_calls.load(Ordering::SeqCst)
    }

    /// Every command handed to `dispatch`, in order.
    #[must_use]
    pub fn dispatched_commands(&self) -> Vec<command::Command> {
        self.dispatched.lock().clone()
    }

    /// Feeds one inbound frame (or error) to whichever `open_stream` call is
    /// currently live. A no-op if no stream is open yet.
    pub fn push_inbound(&self, frame: Result<command::Inbound, ConnectorError>) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    /// Queues the next `open_stream` call to fail with `error` instead of
    /// succeeding, for exercising reconnect.
    pub fn fail_next_open_stream(&self, error: ConnectorError) {
        self.open_stream_failures.lock().push_back(error);
    }

    /// Queues the response the next `dispatch` call returns.
    pub fn queue_dispatch_response(&self, response: Result<Option<command::CommandResponse>, ConnectorError>) {
        self.dispatch_responses.lock().push_back(response);
    }
}

impl Default for FakeCommandTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandTransport for FakeCommandTransport {
    async fn open_stream(
        &self,
    ) -> Result<
        (
            Arc<dyn OutboundSink<command::Outbound>>,
            BoxStream<'static, Result<command::Inbound, ConnectorError>>,
        ),
        ConnectorError,
    > {
        self.open_stream_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.open_stream_failures.lock().pop_front() {
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound_tx.lock() = Some(tx);
        let sink: Arc<dyn OutboundSink<command::Outbound>> = Arc::new(RecordingSink {
            sent: self.sent.clone(),
        });
        Ok((sink, UnboundedReceiverStream::new(rx).boxed()))
    }

    async fn dispatch(
        &self,
        command: command::Command,
    ) -> Result<Option<command::CommandResponse>, ConnectorError> {
        self.dispatched.lock().push(command);
        self.dispatch_responses
            .lock()
            .pop_front()
            .unwrap_or(Ok(None))
    }
}

/// A fake [`QueryTransport`], analogous to [`FakeCommandTransport`].
pub struct FakeQueryTransport {
    sent: Arc<Mutex<Vec<query::Outbound>>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Result<query::Inbound, ConnectorError>>>>,
    query_responses: Mutex<VecDeque<Result<Vec<query::QueryResponse>, ConnectorError>>>,
    subscription_responses:
        Mutex<VecDeque<Result<Vec<query::SubscriptionQueryResponse>, ConnectorError>>>,
    subscription_sent: Arc<Mutex<Vec<query::SubscriptionQueryRequest>>>,
    open_stream_calls: AtomicUsize,
}

impl FakeQueryTransport {
    /// Builds a fake with no queued inbound frames or canned responses.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            inbound_tx: Mutex::new(None),
            query_responses: Mutex::new(VecDeque::new()),
            subscription_responses: Mutex::new(VecDeque::new()),
            subscription_sent: Arc::new(Mutex::new(Vec::new())),
            open_stream_calls: AtomicUsize::new(0),
        }
    }

    /// Every outbound frame sent on the main control stream's sink.
    #[must_use]
    pub fn sent_frames(&self) -> Vec<query::Outbound> {
        self.sent.lock().clone()
    }

    /// How many times `open_stream` has been called so far, for asserting a
    /// connect/reconnect loop did (or did not) attempt another connection.
    #[must_use]
    pub fn open_stream_call_count(&self) -> usize {
        self.open_stream_calls.load(Ordering::SeqCst)
    }

    /// Every `SubscriptionQueryRequest` sent by a live subscription-query
    /// session (via `Self::open_subscription_query`'s sink).
    #[must_use]
    pub fn subscription_sent_frames(&self) -> Vec<query::SubscriptionQueryRequest> {
        self.subscription_sent.lock().clone()
    }

    /// Feeds one inbound frame (or error) to whichever `open_stream` call is
    /// currently live. A no-op if no stream is open yet.
    pub fn push_inbound(&self, frame: Result<query::Inbound, ConnectorError>) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    /// Queues the response stream the next `query` call returns.
    pub fn queue_query_response(&self, response: Result<Vec<query::QueryResponse>, ConnectorError>) {
        self.query_responses.lock().push_back(response);
    }

    /// Queues the response stream the next `open_subscription_query` call
    /// returns.
    pub fn queue_subscription_response(
        &self,
        response: Result<Vec<query::SubscriptionQueryResponse>, ConnectorError>,
    ) {
        self.subscription_responses.lock().push_back(response);
    }
}

impl Default for FakeQueryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryTransport for FakeQueryTransport {
    async fn open_stream(
        &self,
    ) -> Result<
        (
            Arc<dyn OutboundSink<query::Outbound>>,
            BoxStream<'static, Result<query::Inbound, ConnectorError>>,
        ),
        ConnectorError,
    > {
        self.open_stream_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound_tx.lock() = Some(tx);
        let sink: Arc<dyn OutboundSink<query::Outbound>> = Arc::new(RecordingSink {
            sent: self.sent.clone(),
        });
        Ok((sink, UnboundedReceiverStream::new(rx).boxed()))
    }

    async fn query(
        &self,
        request: query::Query,
    ) -> Result<BoxStream<'static, Result<query::QueryResponse, ConnectorError>>, ConnectorError> {
        let _ = request;
        let responses = self.query_responses.lock().pop_front().unwrap_or(Ok(Vec::new()))?;
        Ok(futures::stream::iter(responses.into_iter().map(Ok)).boxed())
    }

    async fn open_subscription_query(
        &self,
        _subscription_id: String,
        _request: query::Query,
    ) -> Result<
        (
            Arc<dyn OutboundSink<query::SubscriptionQueryRequest>>,
            BoxStream<'static, Result<query::SubscriptionQueryResponse, ConnectorError>>,
        ),
        ConnectorError,
    > {
        let sink: Arc<dyn OutboundSink<query::SubscriptionQueryRequest>> = Arc::new(RecordingSink {
            sent: self.subscription_sent.clone(),
        });
        let responses = self
            .subscription_responses
            .lock()
            .pop_front()
            .unwrap_or(Ok(Vec::new()))?;
        Ok((sink, futures::stream::iter(responses.into_iter().map(Ok)).boxed()))
    }
}
