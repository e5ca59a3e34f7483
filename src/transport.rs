//! The managed transport seam, modeled here as a trait boundary so the
//! channel runtime can be built and tested without depending on a
//! concrete HTTP/2 stub layer.
//!
//! A production binding implements these traits over `tonic`-generated
//! client stubs; [`crate::testing`] provides an in-memory fake used by this
//! crate's own tests.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::ConnectorError;
use crate::outbound::OutboundSink;
use crate::wire::command;
use crate::wire::query;

/// Opens and drives RPCs for the Command channel.
#[async_trait]
pub trait CommandTransport: Send + Sync + 'static {
    /// Opens `Command.openStream`, the long-lived bidi control stream.
    async fn open_stream(
        &self,
    ) -> Result<
        (
            Arc<dyn OutboundSink<command::Outbound>>,
            BoxStream<'static, Result<command::Inbound, ConnectorError>>,
        ),
        ConnectorError,
    >;

    /// Calls the unary `Command.dispatch` RPC. `Ok(None)` means the call
    /// completed with no result payload at all, distinct from a
    /// `CommandResponse` carrying an `error_code`.
    async fn dispatch(
        &self,
        command: command::Command,
    ) -> Result<Option<command::CommandResponse>, ConnectorError>;
}

/// Opens and drives RPCs for the Query channel.
#[async_trait]
pub trait QueryTransport: Send + Sync + 'static {
    /// Opens `Query.openStream`, the long-lived bidi control stream used
    /// both for handler dispatch and for this client's own subscribe
    /// traffic.
    async fn open_stream(
        &self,
    ) -> Result<
        (
            Arc<dyn OutboundSink<query::Outbound>>,
            BoxStream<'static, Result<query::Inbound, ConnectorError>>,
        ),
        ConnectorError,
    >;

    /// Calls the server-streaming `Query.query` RPC.
    async fn query(
        &self,
        request: query::Query,
    ) -> Result<BoxStream<'static, Result<query::QueryResponse, ConnectorError>>, ConnectorError>;

    /// Opens `Query.subscription` for one subscription-query session.
    async fn open_subscription_query(
        &self,
        subscription_id: String,
        request: query::Query,
    ) -> Result<
        (
            Arc<dyn OutboundSink<query::SubscriptionQueryRequest>>,
            BoxStream<'static, Result<query::SubscriptionQueryResponse, ConnectorError>>,
        ),
        ConnectorError,
    >;
}
