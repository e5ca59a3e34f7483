//! Ambient configuration surface.
//!
//! Every tunable has a `default_*()` function wired through
//! `#[serde(default = "...")]` rather than an ad hoc literal scattered
//! through constructors.

use serde::Deserialize;
use std::time::Duration;

use crate::identity::ClientIdentity;

const fn default_permits() -> u32 {
    5_000
}

const fn default_flow_control_batch() -> u32 {
    2_500
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(2)
}

const fn default_result_stream_buffer_size() -> u32 {
    64
}

const fn default_result_stream_fetch_size() -> u32 {
    32
}

/// Tuning shared by both the Command and Query channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    /// Initial inbound-frame permits granted to the server on connect.
    #[serde(default = "default_permits")]
    pub permits: u32,

    /// Number of consumed permits that triggers a refill grant of the same
    /// size.
    #[serde(default = "default_flow_control_batch")]
    pub flow_control_batch: u32,

    /// Delay between reconnect attempts absent an immediate-reconnect
    /// request.
    #[serde(default = "default_reconnect_backoff", with = "humantime_serde")]
    pub reconnect_backoff: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            permits: default_permits(),
            flow_control_batch: default_flow_control_batch(),
            reconnect_backoff: default_reconnect_backoff(),
        }
    }
}

/// Per-call tuning for a subscription query.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionQueryConfig {
    /// Bounded buffer size for the update stream.
    #[serde(default = "default_result_stream_buffer_size")]
    pub buffer_size: u32,
    /// Permits refilled per batch over `buffer_size` ("fetchSize
    /// batch over bufferSize permits").
    #[serde(default = "default_result_stream_fetch_size")]
    pub fetch_size: u32,
}

impl Default for SubscriptionQueryConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_result_stream_buffer_size(),
            fetch_size: default_result_stream_fetch_size(),
        }
    }
}

/// Top-level connector configuration: identity plus per-channel tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorConfig {
    /// The identity stamped onto every outbound frame.
    pub client_id: String,
    /// The identity stamped onto every outbound frame.
    pub component_name: String,
    /// Command channel tuning.
    #[serde(default)]
    pub command: ChannelConfig,
    /// Query channel tuning.
    #[serde(default)]
    pub query: ChannelConfig,
}

impl ConnectorConfig {
    /// The [`ClientIdentity`] this configuration stamps onto frames.
    #[must_use]
    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity::new(self.client_id.clone(), self.component_name.clone())
    }
}
