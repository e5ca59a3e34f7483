//! Wire message shapes.
//!
//! The real wire format (protobuf tagged unions exchanged with an
//! AxonServer-style cluster) is an external collaborator to this crate.
//! These types stand in for what a `prost`-generated module would provide:
//! plain records with no behavior of their own.

use crate::error::ServerError;

/// Metadata key under which the routing-key processing instruction is
/// carried on an outbound [`command::Command`].
pub const ROUTING_KEY: &str = "ROUTING_KEY";

/// A single key/value processing instruction attached to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingInstruction {
    /// The instruction key, e.g. [`ROUTING_KEY`].
    pub key: String,
    /// The instruction's text value.
    pub value: String,
}

/// The outcome of an acknowledged instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The instruction was processed successfully.
    Success,
    /// The instruction was rejected; carries the server's error.
    Failure(ServerError),
}

/// An inbound acknowledgement of a previously sent instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionAck {
    /// The instruction id this ack correlates to.
    pub instruction_id: String,
    /// Success or failure, with the server's error on failure.
    pub outcome: AckOutcome,
}

/// A flow-control grant sent upstream to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    /// The number of additional permits granted, cumulative on the server
    /// side (the client never decreases a previously granted amount).
    pub permits: u32,
}

/// Command-channel wire shapes.
pub mod command {
    use super::ProcessingInstruction;

    /// Sent by the client to register interest in a command name.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Subscribe {
        /// Id of this instruction; a fresh ack-bearing id.
        pub instruction_id: String,
        /// The command name being subscribed to.
        pub command: String,
        /// Identity of the subscribing client.
        pub client_id: String,
        /// Identity of the subscribing component.
        pub component_name: String,
        /// Relative load this client can accept for the command.
        pub load_factor: u32,
    }

    /// Sent by the client to withdraw interest in a command name.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Unsubscribe {
        /// Id of this instruction; a fresh ack-bearing id.
        pub instruction_id: String,
        /// The command name being unsubscribed from.
        pub command: String,
        /// Identity of the unsubscribing client.
        pub client_id: String,
        /// Identity of the unsubscribing component.
        pub component_name: String,
    }

    /// A command routed to this client by the server for local handling.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Command {
        /// Id to ack/nack receipt of this instruction; empty means the
        /// server expects no ack (see [`super::InstructionAck`]).
        pub instruction_id: String,
        /// Correlates the eventual [`CommandResponse`] back to the caller.
        pub message_id: String,
        /// The command name, used to look up a registered handler.
        pub name: String,
        /// Opaque command payload.
        pub payload: Vec<u8>,
        /// Identity of the command's originating client, if known.
        pub client_id: String,
        /// Identity of the command's originating component, if known.
        pub component_name: String,
        /// Processing instructions attached to the command, e.g. the
        /// [`super::ROUTING_KEY`] metadata.
        pub processing_instructions: Vec<ProcessingInstruction>,
    }

    impl Command {
        /// The routing-key value, if a [`super::ROUTING_KEY`] processing
        /// instruction is present.
        #[must_use]
        pub fn routing_key(&self) -> Option<&str> {
            self.processing_instructions
                .iter()
                .find(|pi| pi.key == super::ROUTING_KEY)
                .map(|pi| pi.value.as_str())
        }
    }

    /// A reply to a routed [`Command`], sent back to the peer.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct CommandResponse {
        /// Echoes the originating command's `message_id`.
        pub request_identifier: String,
        /// Opaque response payload; empty on error.
        pub payload: Vec<u8>,
        /// Set when the command could not be handled.
        pub error_code: Option<String>,
        /// Accompanies `error_code`.
        pub error_message: Option<String>,
    }

    impl CommandResponse {
        /// Builds a successful response.
        #[must_use]
        pub fn success(request_identifier: impl Into<String>, payload: Vec<u8>) -> Self {
            Self {
                request_identifier: request_identifier.into(),
                payload,
                error_code: None,
                error_message: None,
            }
        }

        /// Builds an error response carrying a stable error category.
        #[must_use]
        pub fn error(
            request_identifier: impl Into<String>,
            error_code: impl Into<String>,
            error_message: impl Into<String>,
        ) -> Self {
            Self {
                request_identifier: request_identifier.into(),
                payload: Vec::new(),
                error_code: Some(error_code.into()),
                error_message: Some(error_message.into()),
            }
        }
    }

    /// Frames the server may send on the command control stream.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Inbound {
        /// A command routed for local handling.
        Command(Command),
        /// An ack for a previously sent instruction.
        Ack(super::InstructionAck),
    }

    impl Inbound {
        /// The instruction id carried by this frame, if any.
        #[must_use]
        pub fn instruction_id(&self) -> Option<&str> {
            match self {
                Inbound::Command(command) => Some(&command.instruction_id),
                Inbound::Ack(ack) => Some(&ack.instruction_id),
            }
        }

        /// A short label for logging/nack purposes.
        #[must_use]
        pub fn kind(&self) -> &'static str {
            match self {
                Inbound::Command(_) => "Command",
                Inbound::Ack(_) => "Ack",
            }
        }
    }

    /// Frames the client may send on the command control stream.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Outbound {
        /// Register interest in a command name.
        Subscribe(Subscribe),
        /// Withdraw interest in a command name.
        Unsubscribe(Unsubscribe),
        /// Acknowledge an inbound [`Command`] or [`Inbound`] frame.
        Ack(super::InstructionAck),
        /// Grant additional inbound-frame permits.
        FlowControl(super::FlowControl),
        /// Reply to a routed [`Command`].
        CommandResponse(CommandResponse),
    }
}

/// Query-channel wire shapes.
pub mod query {
    /// Sent by the client to register interest in a query name / result type.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Subscribe {
        /// Id of this instruction; a fresh ack-bearing id.
        pub instruction_id: String,
        /// The query name being subscribed to.
        pub query_name: String,
        /// The result type this subscription applies to.
        pub result_name: String,
        /// Identity of the subscribing client.
        pub client_id: String,
        /// Identity of the subscribing component.
        pub component_name: String,
    }

    /// Sent by the client to withdraw interest in a query name / result type.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Unsubscribe {
        /// Id of this instruction; a fresh ack-bearing id.
        pub instruction_id: String,
        /// The query name being unsubscribed from.
        pub query_name: String,
        /// The result type this subscription applied to.
        pub result_name: String,
        /// Identity of the unsubscribing client.
        pub client_id: String,
        /// Identity of the unsubscribing component.
        pub component_name: String,
    }

    /// A query routed to this client by the server for local handling.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Query {
        /// Id to ack/nack receipt of this instruction; empty means the
        /// server expects no ack (see [`super::InstructionAck`]).
        pub instruction_id: String,
        /// Correlates [`QueryResponse`]/[`QueryComplete`] back to the caller.
        pub message_id: String,
        /// The query name, used to look up registered handlers.
        pub query_name: String,
        /// The result type the caller expects responses in.
        pub result_name: String,
        /// Opaque query payload.
        pub payload: Vec<u8>,
    }

    /// One response to a routed [`Query`]; a query may receive several,
    /// one per registered handler.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct QueryResponse {
        /// Echoes the originating query's `message_id`.
        pub request_identifier: String,
        /// Opaque response payload.
        pub payload: Vec<u8>,
        /// Set when a handler failed to produce a response.
        pub error_code: Option<String>,
        /// Accompanies `error_code`.
        pub error_message: Option<String>,
    }

    /// Terminates the response stream for a routed [`Query`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct QueryComplete {
        /// Echoes the originating query's `message_id`.
        pub request_identifier: String,
    }

    /// A subscription-query control frame sent by the server.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SubscriptionQueryRequest {
        /// The peer wants to (re)subscribe to updates for `subscription_id`.
        Subscribe {
            /// The subscription this request concerns.
            subscription_id: String,
            /// The underlying query driving the subscription.
            query: Query,
        },
        /// The peer wants to cancel `subscription_id`.
        Unsubscribe {
            /// The subscription to cancel.
            subscription_id: String,
        },
        /// The peer wants the one-shot initial result for `subscription_id`.
        GetInitialResult {
            /// The subscription this request concerns.
            subscription_id: String,
            /// The underlying query driving the subscription.
            query: Query,
        },
    }

    impl SubscriptionQueryRequest {
        /// The subscription id this request concerns.
        #[must_use]
        pub fn subscription_id(&self) -> &str {
            match self {
                SubscriptionQueryRequest::Subscribe { subscription_id, .. }
                | SubscriptionQueryRequest::Unsubscribe { subscription_id }
                | SubscriptionQueryRequest::GetInitialResult { subscription_id, .. } => {
                    subscription_id
                }
            }
        }
    }

    /// A reply frame belonging to a subscription-query session.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SubscriptionQueryResponse {
        /// The one-shot initial result.
        InitialResult {
            /// The subscription this reply concerns.
            subscription_id: String,
            /// Opaque payload.
            payload: Vec<u8>,
        },
        /// A streamed update event.
        Update {
            /// The subscription this reply concerns.
            subscription_id: String,
            /// Opaque payload.
            payload: Vec<u8>,
        },
        /// Signals normal completion of the subscription.
        Complete {
            /// The subscription this reply concerns.
            subscription_id: String,
        },
    }

    /// Frames the server may send on the query control stream.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Inbound {
        /// A query routed for local handling.
        Query(Query),
        /// An ack for a previously sent instruction.
        Ack(super::InstructionAck),
        /// A subscription-query control request.
        SubscriptionQueryRequest(SubscriptionQueryRequest),
    }

    impl Inbound {
        /// The instruction id carried by this frame, if any.
        #[must_use]
        pub fn instruction_id(&self) -> Option<&str> {
            match self {
                Inbound::Query(query) => Some(&query.instruction_id),
                Inbound::Ack(ack) => Some(&ack.instruction_id),
                Inbound::SubscriptionQueryRequest(_) => None,
            }
        }

        /// A short label for logging/nack purposes.
        #[must_use]
        pub fn kind(&self) -> &'static str {
            match self {
                Inbound::Query(_) => "Query",
                Inbound::Ack(_) => "Ack",
                Inbound::SubscriptionQueryRequest(req) => match req {
                    SubscriptionQueryRequest::Subscribe { .. } => "SubscriptionQuery.Subscribe",
                    SubscriptionQueryRequest::Unsubscribe { .. } => "SubscriptionQuery.Unsubscribe",
                    SubscriptionQueryRequest::GetInitialResult { .. } => {
                        "SubscriptionQuery.GetInitialResult"
                    }
                },
            }
        }
    }

    /// Frames the client may send on the query control stream.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Outbound {
        /// Register interest in a query name / result type.
        Subscribe(Subscribe),
        /// Withdraw interest in a query name / result type.
        Unsubscribe(Unsubscribe),
        /// Acknowledge an inbound frame.
        Ack(super::InstructionAck),
        /// Grant additional inbound-frame permits.
        FlowControl(super::FlowControl),
        /// One response to a routed query.
        QueryResponse(QueryResponse),
        /// Terminates the response stream for a routed query.
        QueryComplete(QueryComplete),
        /// A subscription-query reply.
        SubscriptionQueryResponse(SubscriptionQueryResponse),
    }
}
