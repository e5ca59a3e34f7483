//! A client-side connector for participating as a node in an
//! AxonServer-style message-routing cluster.
//!
//! This crate is the channel runtime shared by every logical interaction
//! channel multiplexed over one managed transport connection: the
//! pending-instruction ack registry, the outbound stream holder, the
//! permit-based flow-control governor, the reconnect supervisor, and the
//! handler registries, instantiated concretely for the [`command`] and
//! [`query`] channels.
//!
//! The underlying transport (HTTP/2 multiplexed RPC and its stub-generation
//! layer) is deliberately out of scope; [`transport`] defines the trait
//! seam a binding implements, and [`testing`] provides an in-memory fake
//! used by this crate's own test suite.

pub mod buffered_stream;
pub mod command;
pub mod config;
pub mod error;
pub mod identity;
pub mod incoming;
pub mod outbound;
pub mod pending;
pub mod permit;
pub mod query;
pub mod reconnect;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod wire;

pub use command::{CommandChannel, CommandHandler, CommandHandlerRegistration, CommandHandlerRegistry};
pub use config::{ChannelConfig, ConnectorConfig, SubscriptionQueryConfig};
pub use error::{ConnectorError, ErrorCategory, ServerError};
pub use identity::ClientIdentity;
pub use query::{
    ProviderSubscription, QueryChannel, QueryHandler, QueryHandlerRegistration, QueryHandlerRegistry,
    SubscriptionQuerySession, SubscriptionState,
};
pub use reconnect::ConnectionState;
pub use transport::{CommandTransport, QueryTransport};
