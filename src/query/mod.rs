//! The Query channel: server-streaming query, subscription query, and
//! multi-handler fan-in for routed queries.

pub mod channel;
pub mod handler;
pub mod subscription;

pub use channel::{QueryChannel, QueryHandlerRegistration};
pub use handler::{HandlerError, QueryHandler, QueryHandlerRegistry};
pub use subscription::{ProviderSubscription, SubscriptionQuerySession, SubscriptionState};
