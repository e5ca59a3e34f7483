//! The Query channel: server-streaming query, subscription query, and
//! multi-handler fan-in for routed queries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::buffered_stream::buffered_result_stream;
use crate::config::{ChannelConfig, SubscriptionQueryConfig};
use crate::error::ConnectorError;
use crate::identity::{fresh_instruction_id, ClientIdentity};
use crate::incoming::{meter_dispatch, ReplyChannel};
use crate::outbound::OutboundHolder;
use crate::pending::PendingInstructionRegistry;
use crate::permit::FlowControlGovernor;
use crate::reconnect::ReconnectSupervisor;
use crate::transport::QueryTransport;
use crate::wire::{self, query, AckOutcome};

use super::handler::{QueryHandler, QueryHandlerRegistry};
use super::subscription::{ProviderSubscription, SubscriptionQuerySession};

const CHANNEL_NAME: &str = "query";

/// The handle returned by [`QueryChannel::register_query_handler`].
pub struct QueryHandlerRegistration {
    query_name: String,
    result_name: String,
    handler: Arc<dyn QueryHandler>,
    registry: Arc<QueryHandlerRegistry>,
    outbound: Arc<OutboundHolder<query::Outbound>>,
    pending: Arc<PendingInstructionRegistry>,
    identity: ClientIdentity,
}

impl QueryHandlerRegistration {
    /// Removes this handler from its `(queryName, resultType)` pair. Sends
    /// Unsubscribe only if this removal leaves the pair with no handlers,
    /// and only if the handler wasn't already removed by an earlier call.
    pub async fn cancel(&self) -> Result<(), ConnectorError> {
        if !self
            .registry
            .remove(&self.query_name, &self.result_name, &self.handler)
        {
            return Ok(());
        }
        let instruction_id = fresh_instruction_id();
        let ack = self.pending.track(&instruction_id);
        let frame = query::Outbound::Unsubscribe(query::Unsubscribe {
            instruction_id,
            query_name: self.query_name.clone(),
            result_name: self.result_name.clone(),
            client_id: self.identity.client_id.clone(),
            component_name: self.identity.component_name.clone(),
        });
        self.outbound.send(CHANNEL_NAME, frame).await?;
        ack.await
    }
}

/// Binds the shared channel-runtime machinery for query dispatch.
pub struct QueryChannel<T: QueryTransport> {
    identity: ClientIdentity,
    transport: Arc<T>,
    outbound: Arc<OutboundHolder<query::Outbound>>,
    pending: Arc<PendingInstructionRegistry>,
    handlers: Arc<QueryHandlerRegistry>,
    governor: FlowControlGovernor,
    supervisor: ReconnectSupervisor,
    permits: u32,
    provider_subscriptions: Mutex<HashMap<String, Arc<ProviderSubscription>>>,
}

impl<T: QueryTransport> QueryChannel<T> {
    /// Builds a channel over `transport`, not yet connected. Call
    /// [`Self::spawn`] to start the connect/reconnect loop.
    pub fn new(identity: ClientIdentity, transport: Arc<T>, config: &ChannelConfig) -> Arc<Self> {
        Arc::new(Self {
            identity,
            transport,
            outbound: Arc::new(OutboundHolder::new()),
            pending: Arc::new(PendingInstructionRegistry::new()),
            handlers: Arc::new(QueryHandlerRegistry::new()),
            governor: FlowControlGovernor::new(config.flow_control_batch),
            supervisor: ReconnectSupervisor::new(CHANNEL_NAME, config.reconnect_backoff),
            permits: config.permits,
            provider_subscriptions: Mutex::new(HashMap::new()),
        })
    }

    /// Whether the channel currently has an authoritative outbound stream.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.supervisor.is_connected()
    }

    /// Forces an immediate reconnect attempt, cutting short any backoff the
    /// connect loop is currently waiting out.
    pub fn reconnect(&self) {
        self.supervisor.schedule_immediate_reconnect();
    }

    /// Spawns the connect/reconnect loop as a background task.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.supervisor.is_shutdown() {
                return;
            }
            self.supervisor.mark_connecting();
            match self.transport.open_stream().await {
                Ok((sink, stream)) => {
                    self.outbound.get_and_set(Some(sink));
                    self.supervisor.mark_connected();
                    let reply = ReplyChannel::new(self.outbound.clone(), CHANNEL_NAME);
                    let initial_permits = self.governor.enable_flow_control(self.permits);
                    if let Err(error) = reply
                        .send(query::Outbound::FlowControl(wire::FlowControl {
                            permits: initial_permits,
                        }))
                        .await
                    {
                        tracing::warn!(%error, channel = CHANNEL_NAME, "failed to send initial flow-control grant");
                    }
                    self.replay_subscriptions(&reply).await;
                    self.drive(stream, &reply).await;
                }
                Err(error) => {
                    tracing::warn!(%error, channel = CHANNEL_NAME, "failed to open stream");
                }
            }
            if self.supervisor.is_shutdown() {
                return;
            }
            self.supervisor.mark_reconnecting();
            self.supervisor.wait_backoff().await;
        }
    }

    async fn drive(
        &self,
        mut stream: BoxStream<'static, Result<query::Inbound, ConnectorError>>,
        reply: &ReplyChannel<query::Outbound>,
    ) {
        loop {
            match stream.next().await {
                Some(Ok(frame)) => {
                    self.dispatch_inbound(frame, reply).await;
                    meter_dispatch(&self.governor, reply, |permits| {
                        query::Outbound::FlowControl(wire::FlowControl { permits })
                    })
                    .await;
                }
                Some(Err(cause)) => {
                    self.handle_transport_loss(cause);
                    return;
                }
                None => {
                    self.handle_transport_loss(ConnectorError::Transport {
                        channel: CHANNEL_NAME,
                        reason: "inbound stream ended".into(),
                    });
                    return;
                }
            }
        }
    }

    fn handle_transport_loss(&self, cause: ConnectorError) {
        tracing::error!(error = %cause, channel = CHANNEL_NAME, "transport lost");
        self.outbound.get_and_set(None);
        self.pending.fail_all(&cause);
        for (_, state) in self.provider_subscriptions.lock().drain() {
            state.cancel();
        }
    }

    async fn replay_subscriptions(&self, reply: &ReplyChannel<query::Outbound>) {
        for (query_name, result_name) in self.handlers.snapshot() {
            let instruction_id = fresh_instruction_id();
            let _ = self.pending.track(&instruction_id);
            let frame = query::Outbound::Subscribe(query::Subscribe {
                instruction_id,
                query_name,
                result_name,
                client_id: self.identity.client_id.clone(),
                component_name: self.identity.component_name.clone(),
            });
            if let Err(error) = reply.send(frame).await {
                tracing::warn!(%error, channel = CHANNEL_NAME, "failed to replay subscription");
            }
        }
    }

    async fn dispatch_inbound(&self, frame: query::Inbound, reply: &ReplyChannel<query::Outbound>) {
        match frame {
            query::Inbound::Ack(ack) => {
                self.pending.ack(&ack.instruction_id, ack.outcome);
            }
            query::Inbound::Query(query) => {
                self.dispatch_query(query, reply).await;
            }
            query::Inbound::SubscriptionQueryRequest(request) => {
                self.dispatch_subscription_request(request, reply).await;
            }
        }
    }

    async fn dispatch_query(&self, query: query::Query, reply: &ReplyChannel<query::Outbound>) {
        if !query.instruction_id.is_empty() {
            let ack = wire::InstructionAck {
                instruction_id: query.instruction_id.clone(),
                outcome: AckOutcome::Success,
            };
            if let Err(error) = reply.send(query::Outbound::Ack(ack)).await {
                tracing::warn!(%error, channel = CHANNEL_NAME, "failed to ack routed query");
            }
        }

        let handlers = self.handlers.get(&query.query_name, &query.result_name);
        if handlers.is_empty() {
            let response = query::QueryResponse {
                request_identifier: query.message_id.clone(),
                payload: Vec::new(),
                error_code: Some(crate::error::ErrorCategory::NO_HANDLER_FOR_QUERY.to_string()),
                error_message: Some(format!(
                    "no handler registered for query '{}'",
                    query.query_name
                )),
            };
            if let Err(error) = reply.send(query::Outbound::QueryResponse(response)).await {
                tracing::warn!(%error, channel = CHANNEL_NAME, "failed to send no-handler response");
            }
            let complete = query::QueryComplete {
                request_identifier: query.message_id.clone(),
            };
            if let Err(error) = reply.send(query::Outbound::QueryComplete(complete)).await {
                tracing::warn!(%error, channel = CHANNEL_NAME, "failed to send query-complete");
            }
            return;
        }

        // Counter starts at the handler count and decrements on each
        // completion; the handler whose decrement reaches zero emits the
        // single QueryComplete.
        let remaining = Arc::new(AtomicUsize::new(handlers.len()));
        for handler in handlers {
            let reply = reply.clone();
            let remaining = remaining.clone();
            let message_id = query.message_id.clone();
            let query = query.clone();
            tokio::spawn(async move {
                let outcome = handler.handle(query).await;
                let response = match outcome {
                    Ok(payload) => query::QueryResponse {
                        request_identifier: message_id.clone(),
                        payload,
                        error_code: None,
                        error_message: None,
                    },
                    Err(handler_error) => query::QueryResponse {
                        request_identifier: message_id.clone(),
                        payload: Vec::new(),
                        error_code: None,
                        error_message: Some(handler_error.message),
                    },
                };
                if let Err(error) = reply.send(query::Outbound::QueryResponse(response)).await {
                    tracing::warn!(%error, channel = CHANNEL_NAME, "failed to send query response");
                }
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let complete = query::QueryComplete {
                        request_identifier: message_id,
                    };
                    if let Err(error) = reply.send(query::Outbound::QueryComplete(complete)).await {
                        tracing::warn!(%error, channel = CHANNEL_NAME, "failed to send query-complete");
                    }
                }
            });
        }
    }

    async fn dispatch_subscription_request(
        &self,
        request: query::SubscriptionQueryRequest,
        reply: &ReplyChannel<query::Outbound>,
    ) {
        match request {
            query::SubscriptionQueryRequest::GetInitialResult { subscription_id, query } => {
                let Some(handler) = self
                    .handlers
                    .get(&query.query_name, &query.result_name)
                    .into_iter()
                    .next()
                else {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        query_name = %query.query_name,
                        "no handler registered to serve initial result"
                    );
                    return;
                };
                let reply = reply.clone();
                tokio::spawn(async move {
                    match handler.handle(query).await {
                        Ok(payload) => {
                            let frame = query::SubscriptionQueryResponse::InitialResult {
                                subscription_id,
                                payload,
                            };
                            if let Err(error) =
                                reply.send(query::Outbound::SubscriptionQueryResponse(frame)).await
                            {
                                tracing::warn!(%error, channel = CHANNEL_NAME, "failed to send initial result");
                            }
                        }
                        Err(error) => {
                            tracing::warn!(%error, subscription_id = %subscription_id, "initial-result handler failed");
                        }
                    }
                });
            }
            query::SubscriptionQueryRequest::Subscribe { subscription_id, query } => {
                let Some(handler) = self
                    .handlers
                    .get(&query.query_name, &query.result_name)
                    .into_iter()
                    .next()
                else {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        query_name = %query.query_name,
                        "no handler registered to serve subscription"
                    );
                    return;
                };
                let state = Arc::new(ProviderSubscription::new());
                self.provider_subscriptions
                    .lock()
                    .insert(subscription_id.clone(), state.clone());
                let reply = reply.clone();
                tokio::spawn(async move {
                    if !state.mark_streaming() {
                        return;
                    }
                    match handler.handle(query).await {
                        Ok(payload) => {
                            if state.is_active() {
                                let frame = query::SubscriptionQueryResponse::Update {
                                    subscription_id: subscription_id.clone(),
                                    payload,
                                };
                                if let Err(error) = reply
                                    .send(query::Outbound::SubscriptionQueryResponse(frame))
                                    .await
                                {
                                    tracing::warn!(%error, channel = CHANNEL_NAME, "failed to send update");
                                }
                            }
                        }
                        Err(error) => {
                            tracing::warn!(%error, subscription_id = %subscription_id, "subscription handler failed");
                        }
                    }
                    if state.is_active() {
                        state.mark_completed();
                        let frame = query::SubscriptionQueryResponse::Complete { subscription_id };
                        if let Err(error) =
                            reply.send(query::Outbound::SubscriptionQueryResponse(frame)).await
                        {
                            tracing::warn!(%error, channel = CHANNEL_NAME, "failed to send subscription complete");
                        }
                    }
                });
            }
            query::SubscriptionQueryRequest::Unsubscribe { subscription_id } => {
                if let Some(state) = self.provider_subscriptions.lock().remove(&subscription_id) {
                    state.cancel();
                }
            }
        }
    }

    /// Registers `handler` for `(query_name, result_name)`. Sends a
    /// Subscribe only if this is the first handler for that pair; the
    /// returned future resolves once that Subscribe (if any) is acked.
    pub fn register_query_handler(
        self: &Arc<Self>,
        handler: Arc<dyn QueryHandler>,
        query_name: impl Into<String>,
        result_name: impl Into<String>,
    ) -> (
        QueryHandlerRegistration,
        impl std::future::Future<Output = Result<(), ConnectorError>>,
    ) {
        let query_name = query_name.into();
        let result_name = result_name.into();
        let is_first = self.handlers.add(&query_name, &result_name, handler.clone());

        let outbound = self.outbound.clone();
        let pending = self.pending.clone();
        let identity = self.identity.clone();
        let qn = query_name.clone();
        let rn = result_name.clone();
        let acks_future = async move {
            if !is_first {
                return Ok(());
            }
            let instruction_id = fresh_instruction_id();
            let ack = pending.track(&instruction_id);
            let frame = query::Outbound::Subscribe(query::Subscribe {
                instruction_id,
                query_name: qn,
                result_name: rn,
                client_id: identity.client_id.clone(),
                component_name: identity.component_name.clone(),
            });
            outbound.send(CHANNEL_NAME, frame).await?;
            ack.await
        };

        let registration = QueryHandlerRegistration {
            query_name,
            result_name,
            handler,
            registry: self.handlers.clone(),
            outbound: self.outbound.clone(),
            pending: self.pending.clone(),
            identity: self.identity.clone(),
        };
        (registration, acks_future)
    }

    /// Opens the server-streaming query RPC, stamping a message id if the
    /// caller omitted one.
    pub async fn query(
        &self,
        mut request: query::Query,
    ) -> Result<BoxStream<'static, Result<query::QueryResponse, ConnectorError>>, ConnectorError> {
        if request.message_id.is_empty() {
            request.message_id = fresh_instruction_id();
        }
        self.transport.query(request).await
    }

    /// Opens a subscription query: a dedicated RPC yielding a lazily-fetched
    /// initial result plus a bounded stream of updates.
    pub async fn subscription_query(
        &self,
        mut request: query::Query,
        config: &SubscriptionQueryConfig,
    ) -> Result<SubscriptionQuerySession, ConnectorError> {
        if request.message_id.is_empty() {
            request.message_id = fresh_instruction_id();
        }
        let subscription_id = fresh_instruction_id();
        let (sink, mut stream) = self
            .transport
            .open_subscription_query(subscription_id.clone(), request.clone())
            .await?;

        // Updates flow over this dedicated RPC rather than the governed
        // control stream, so there is no outbound flow-control frame to
        // synthesize here; the refill hook just tracks local consumption.
        let (producer, updates) = buffered_result_stream::<Vec<u8>>(
            config.buffer_size,
            config.fetch_size,
            |_batch| {},
        );
        let (initial_tx, initial_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut initial_tx = Some(initial_tx);
            loop {
                match stream.next().await {
                    Some(Ok(query::SubscriptionQueryResponse::InitialResult { payload, .. })) => {
                        if let Some(tx) = initial_tx.take() {
                            let _ = tx.send(Ok(payload));
                        }
                    }
                    Some(Ok(query::SubscriptionQueryResponse::Update { payload, .. })) => {
                        if producer.push(payload).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(query::SubscriptionQueryResponse::Complete { .. })) => {
                        producer.complete().await;
                        break;
                    }
                    Some(Err(cause)) => {
                        if let Some(tx) = initial_tx.take() {
                            let _ = tx.send(Err(cause.clone()));
                        }
                        producer.fail(cause).await;
                        break;
                    }
                    None => {
                        let cause = ConnectorError::Transport {
                            channel: CHANNEL_NAME,
                            reason: "subscription stream ended".into(),
                        };
                        if let Some(tx) = initial_tx.take() {
                            let _ = tx.send(Err(cause.clone()));
                        }
                        producer.fail(cause).await;
                        break;
                    }
                }
            }
        });

        Ok(SubscriptionQuerySession::new(
            subscription_id,
            request,
            sink,
            initial_rx,
            updates,
        ))
    }

    /// Sends Unsubscribe for every registered `(queryName, resultType)` pair
    /// and awaits every ack, without tearing down the transport.
    pub async fn prepare_disconnect(&self) -> Result<(), ConnectorError> {
        let mut acks = Vec::new();
        for (query_name, result_name) in self.handlers.snapshot() {
            let instruction_id = fresh_instruction_id();
            let ack = self.pending.track(&instruction_id);
            let frame = query::Outbound::Unsubscribe(query::Unsubscribe {
                instruction_id,
                query_name,
                result_name,
                client_id: self.identity.client_id.clone(),
                component_name: self.identity.component_name.clone(),
            });
            self.outbound.send(CHANNEL_NAME, frame).await?;
            acks.push(ack);
        }
        for ack in acks {
            ack.await?;
        }
        Ok(())
    }

    /// Sends unsubscribes best-effort, clears the registry, cancels every
    /// provider-side subscription, and closes the outbound side. Also tells
    /// the `spawn`ed connect/reconnect loop to stop instead of re-opening
    /// the stream once this one ends.
    pub async fn disconnect(&self) {
        for (query_name, result_name) in self.handlers.snapshot() {
            let frame = query::Outbound::Unsubscribe(query::Unsubscribe {
                instruction_id: fresh_instruction_id(),
                query_name,
                result_name,
                client_id: self.identity.client_id.clone(),
                component_name: self.identity.component_name.clone(),
            });
            let _ = self.outbound.send(CHANNEL_NAME, frame).await;
        }
        self.handlers.clear();
        self.supervisor.request_shutdown();
        for (_, state) in self.provider_subscriptions.lock().drain() {
            state.cancel();
        }
        if let Some(sink) = self.outbound.get_and_set(None) {
            sink.close().await;
        }
        self.supervisor.mark_disconnected();
        self.pending.fail_all(&ConnectorError::Disconnected);
    }

    /// The configured permits granted to the server on connect.
    #[must_use]
    pub fn initial_permits(&self) -> u32 {
        self.permits
    }
}
