//! The Command channel: fire-and-forget dispatch with a single
//! response, plus handler subscription and reconnect replay.

use std::sync::Arc;

use futures::StreamExt;

use crate::config::ChannelConfig;
use crate::error::{ConnectorError, ErrorCategory};
use crate::identity::{fresh_instruction_id, ClientIdentity};
use crate::incoming::{meter_dispatch, ReplyChannel};
use crate::outbound::OutboundHolder;
use crate::pending::PendingInstructionRegistry;
use crate::permit::FlowControlGovernor;
use crate::reconnect::ReconnectSupervisor;
use crate::transport::CommandTransport;
use crate::wire::{self, command, AckOutcome, ProcessingInstruction, ROUTING_KEY};

use super::handler::{CommandHandler, CommandHandlerRegistry};

const CHANNEL_NAME: &str = "command";

/// The handle returned by [`CommandChannel::register_handler`]. Owns the
/// cancel action: unsubscribing a name only removes it from the local
/// registry if no later registration has replaced this one's handler.
pub struct CommandHandlerRegistration {
    names: Vec<String>,
    handler: Arc<dyn CommandHandler>,
    registry: Arc<CommandHandlerRegistry>,
    outbound: Arc<OutboundHolder<command::Outbound>>,
    pending: Arc<PendingInstructionRegistry>,
    identity: ClientIdentity,
}

impl CommandHandlerRegistration {
    /// Sends matching Unsubscribe frames for every name this registration
    /// still owns, and removes them from the local registry. A name whose
    /// handler was replaced by a later registration is left untouched.
    /// Calling this more than once sends at most one Unsubscribe per name.
    pub async fn cancel(&self) -> Result<(), ConnectorError> {
        let mut acks = Vec::new();
        for name in &self.names {
            if !self.registry.remove_if_current(name, &self.handler) {
                continue;
            }
            let instruction_id = fresh_instruction_id();
            let ack = self.pending.track(&instruction_id);
            let frame = command::Outbound::Unsubscribe(command::Unsubscribe {
                instruction_id,
                command: name.clone(),
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
}

/// Binds the shared channel-runtime machinery for command dispatch.
pub struct CommandChannel<T: CommandTransport> {
    identity: ClientIdentity,
    transport: Arc<T>,
    outbound: Arc<OutboundHolder<command::Outbound>>,
    pending: Arc<PendingInstructionRegistry>,
    handlers: Arc<CommandHandlerRegistry>,
    governor: FlowControlGovernor,
    supervisor: ReconnectSupervisor,
    permits: u32,
}

impl<T: CommandTransport> CommandChannel<T> {
    /// Builds a channel over `transport`, not yet connected. Call
    /// [`Self::spawn`] to start the connect/reconnect loop.
    pub fn new(identity: ClientIdentity, transport: Arc<T>, config: &ChannelConfig) -> Arc<Self> {
        Arc::new(Self {
            identity,
            transport,
            outbound: Arc::new(OutboundHolder::new()),
            pending: Arc::new(PendingInstructionRegistry::new()),
            handlers: Arc::new(CommandHandlerRegistry::new()),
            governor: FlowControlGovernor::new(config.flow_control_batch),
            supervisor: ReconnectSupervisor::new(CHANNEL_NAME, config.reconnect_backoff),
            permits: config.permits,
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

    /// Spawns the connect/reconnect loop as a background task. Dropping the
    /// returned handle does not stop the loop; call [`Self::disconnect`] to
    /// stop it.
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
                        .send(command::Outbound::FlowControl(wire::FlowControl {
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
        mut stream: futures::stream::BoxStream<'static, Result<command::Inbound, ConnectorError>>,
        reply: &ReplyChannel<command::Outbound>,
    ) {
        loop {
            match stream.next().await {
                Some(Ok(frame)) => {
                    self.dispatch_inbound(frame, reply).await;
                    meter_dispatch(&self.governor, reply, |permits| {
                        command::Outbound::FlowControl(wire::FlowControl { permits })
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
    }

    async fn replay_subscriptions(&self, reply: &ReplyChannel<command::Outbound>) {
        for (name, load_factor) in self.handlers.snapshot() {
            let instruction_id = fresh_instruction_id();
            // The previous connection's pending instructions were already
            // failed by `handle_transport_loss`; this registration isn't
            // awaited by anyone, it just lets a late ack resolve harmlessly.
            let _ = self.pending.track(&instruction_id);
            let frame = command::Outbound::Subscribe(command::Subscribe {
                instruction_id,
                command: name,
                client_id: self.identity.client_id.clone(),
                component_name: self.identity.component_name.clone(),
                load_factor,
            });
            if let Err(error) = reply.send(frame).await {
                tracing::warn!(%error, channel = CHANNEL_NAME, "failed to replay subscription");
            }
        }
    }

    async fn dispatch_inbound(&self, frame: command::Inbound, reply: &ReplyChannel<command::Outbound>) {
        match frame {
            command::Inbound::Ack(ack) => {
                self.pending.ack(&ack.instruction_id, ack.outcome);
            }
            command::Inbound::Command(command) => {
                self.dispatch_command(command, reply).await;
            }
        }
    }

    async fn dispatch_command(&self, command: command::Command, reply: &ReplyChannel<command::Outbound>) {
        let Some(handler) = self.handlers.get(&command.name) else {
            if !command.instruction_id.is_empty() {
                let nack = wire::InstructionAck {
                    instruction_id: command.instruction_id.clone(),
                    outcome: AckOutcome::Failure(crate::error::ServerError {
                        category: ErrorCategory::new(ErrorCategory::NO_HANDLER_FOR_COMMAND),
                        message: format!("no handler registered for command '{}'", command.name),
                    }),
                };
                if let Err(error) = reply.send(command::Outbound::Ack(nack)).await {
                    tracing::warn!(%error, channel = CHANNEL_NAME, "failed to nack unhandled command");
                }
            }
            let response = command::CommandResponse::error(
                command.message_id.clone(),
                ErrorCategory::NO_HANDLER_FOR_COMMAND,
                format!("no handler registered for command '{}'", command.name),
            );
            if let Err(error) = reply.send(command::Outbound::CommandResponse(response)).await {
                tracing::warn!(%error, channel = CHANNEL_NAME, "failed to send no-handler response");
            }
            return;
        };

        if !command.instruction_id.is_empty() {
            let ack = wire::InstructionAck {
                instruction_id: command.instruction_id.clone(),
                outcome: AckOutcome::Success,
            };
            if let Err(error) = reply.send(command::Outbound::Ack(ack)).await {
                tracing::warn!(%error, channel = CHANNEL_NAME, "failed to ack routed command");
            }
        }

        // The permit for this frame is released by the caller once this
        // function returns, not once the handler's future resolves:
        // spawn the handler so dispatch can return immediately.
        let message_id = command.message_id.clone();
        let name = command.name.clone();
        let reply = reply.clone();
        tokio::spawn(async move {
            let outcome = handler.handle(command).await;
            let response = match outcome {
                Ok(payload) => command::CommandResponse::success(message_id, payload),
                Err(handler_error) => command::CommandResponse::error(
                    message_id,
                    ErrorCategory::COMMAND_EXECUTION_ERROR,
                    handler_error.message,
                ),
            };
            if let Err(error) = reply.send(command::Outbound::CommandResponse(response)).await {
                tracing::warn!(%error, channel = CHANNEL_NAME, handler = %name, "failed to send command response");
            }
        });
    }

    /// Registers `handler` under every name in `names`, sending a Subscribe
    /// for each. Returns the registration handle and a future resolving
    /// once every one of those Subscribes has been acked.
    pub fn register_handler(
        self: &Arc<Self>,
        handler: Arc<dyn CommandHandler>,
        load_factor: u32,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> (
        CommandHandlerRegistration,
        impl std::future::Future<Output = Result<(), ConnectorError>>,
    ) {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        for name in &names {
            self.handlers.set(name, handler.clone(), load_factor);
        }

        let outbound = self.outbound.clone();
        let pending = self.pending.clone();
        let identity = self.identity.clone();
        let names_for_send = names.clone();
        let acks_future = {
            let outbound = outbound.clone();
            let pending = pending.clone();
            let identity = identity.clone();
            async move {
                let mut acks = Vec::with_capacity(names_for_send.len());
                for name in names_for_send {
                    let instruction_id = fresh_instruction_id();
                    let ack = pending.track(&instruction_id);
                    let frame = command::Outbound::Subscribe(command::Subscribe {
                        instruction_id,
                        command: name,
                        client_id: identity.client_id.clone(),
                        component_name: identity.component_name.clone(),
                        load_factor,
                    });
                    outbound.send(CHANNEL_NAME, frame).await?;
                    acks.push(ack);
                }
                for ack in acks {
                    ack.await?;
                }
                Ok(())
            }
        };

        let registration = CommandHandlerRegistration {
            names,
            handler,
            registry: self.handlers.clone(),
            outbound,
            pending,
            identity,
        };
        (registration, acks_future)
    }

    /// Dispatches `command` via the unary RPC, stamping identity and
    /// synthesizing a routing key if the caller omitted one.
    pub async fn send_command(
        &self,
        mut command: command::Command,
    ) -> Result<command::CommandResponse, ConnectorError> {
        if command.message_id.is_empty() {
            command.message_id = fresh_instruction_id();
        }
        command.client_id = self.identity.client_id.clone();
        command.component_name = self.identity.component_name.clone();
        if command.routing_key().is_none() {
            command.processing_instructions.push(ProcessingInstruction {
                key: ROUTING_KEY.to_string(),
                value: command.message_id.clone(),
            });
        }

        match self.transport.dispatch(command).await? {
            Some(response) => Ok(response),
            None => Err(ConnectorError::LocalDispatch {
                category: ErrorCategory::new(ErrorCategory::COMMAND_DISPATCH_ERROR),
                message: "reply completed without result".into(),
            }),
        }
    }

    /// Sends Unsubscribe for every registered name and awaits every ack,
    /// without tearing down the transport.
    pub async fn prepare_disconnect(&self) -> Result<(), ConnectorError> {
        let mut acks = Vec::new();
        for (name, _) in self.handlers.snapshot() {
            let instruction_id = fresh_instruction_id();
            let ack = self.pending.track(&instruction_id);
            let frame = command::Outbound::Unsubscribe(command::Unsubscribe {
                instruction_id,
                command: name,
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

    /// Sends unsubscribes best-effort, clears the registry, and closes the
    /// outbound side. Does not drain in-flight handler executions; a
    /// drain-before-teardown variant is left for a later opt-in mode. Also
    /// tells the `spawn`ed connect/reconnect loop to stop instead of
    /// re-opening the stream once this one ends.
    pub async fn disconnect(&self) {
        for (name, _) in self.handlers.snapshot() {
            let frame = command::Outbound::Unsubscribe(command::Unsubscribe {
                instruction_id: fresh_instruction_id(),
                command: name,
                client_id: self.identity.client_id.clone(),
                component_name: self.identity.component_name.clone(),
            });
            let _ = self.outbound.send(CHANNEL_NAME, frame).await;
        }
        self.handlers.clear();
        self.supervisor.request_shutdown();
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
