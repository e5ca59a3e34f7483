//! Shared plumbing for a channel's incoming instruction stream.
//!
//! The dispatch loop itself is written concretely per channel (see
//! `command::channel` and `query::channel`) rather than behind one generic
//! driver — frame-kind dispatch differs enough between Command and Query
//! that a shared loop would just be an extra layer of indirection. What *is*
//! shared is the reply-channel wrapper and the "consume a permit, refill if
//! due" bookkeeping every dispatch performs after handling a frame.

use std::sync::Arc;

use crate::error::ConnectorError;
use crate::outbound::OutboundHolder;
use crate::permit::FlowControlGovernor;

/// The callback interface an incoming-frame dispatcher uses to emit
/// outbound replies. Wraps the channel's [`OutboundHolder`] with the
/// channel name baked in for error messages.
#[derive(Clone)]
pub struct ReplyChannel<O> {
    outbound: Arc<OutboundHolder<O>>,
    channel_name: &'static str,
}

impl<O> ReplyChannel<O> {
    /// Builds a reply channel over `outbound`, tagging errors with
    /// `channel_name`.
    pub fn new(outbound: Arc<OutboundHolder<O>>, channel_name: &'static str) -> Self {
        Self {
            outbound,
            channel_name,
        }
    }

    /// Sends `frame` on the channel's currently installed outbound sink.
    pub async fn send(&self, frame: O) -> Result<(), ConnectorError> {
        self.outbound.send(self.channel_name, frame).await
    }
}

/// Consumes one inbound-frame permit and, if a refill is due, sends the
/// resulting flow-control frame. Logs (does not propagate) a send failure:
/// a flow-control frame lost to a dead stream will be reconciled by the
/// next `enableFlowControl` after reconnect.
pub async fn meter_dispatch<O>(
    governor: &FlowControlGovernor,
    reply: &ReplyChannel<O>,
    make_flow_control: impl Fn(u32) -> O,
) {
    if let Some(batch) = governor.consume_one() {
        let frame = make_flow_control(batch);
        if let Err(error) = reply.send(frame).await {
            tracing::warn!(%error, "failed to send flow-control refill");
        }
    }
}
