//! The reconnect supervisor.
//!
//! Tracks connection state and backoff timing for one channel. The actual
//! connect/resubscribe sequencing lives in each channel's driving loop
//! (`command::channel::CommandChannel::run`, `query::channel::QueryChannel::run`)
//! since it needs channel-specific knowledge (which handlers to replay);
//! this type is the shared state machine and clock the loop drives through.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// Connection lifecycle state for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempt is in progress or established.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The outbound send side has been acquired and installed.
    Connected,
    /// A previously established connection was lost; a reconnect is
    /// pending (after backoff, or immediately if requested).
    Reconnecting,
}

impl ConnectionState {
    const fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Drives the {Disconnected, Connecting, Connected, Reconnecting} state
/// machine and the backoff clock between reconnect attempts.
pub struct ReconnectSupervisor {
    state: AtomicU8,
    backoff: Duration,
    immediate: Notify,
    shutdown: AtomicBool,
    channel_name: &'static str,
}

impl ReconnectSupervisor {
    /// Builds a supervisor starting `Disconnected`, backing off `backoff`
    /// between reconnect attempts unless `scheduleImmediateReconnect` is
    /// called.
    #[must_use]
    pub fn new(channel_name: &'static str, backoff: Duration) -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected.to_u8()),
            backoff,
            immediate: Notify::new(),
            shutdown: AtomicBool::new(false),
            channel_name,
        }
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether the channel currently has an authoritative outbound stream.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn transition(&self, to: ConnectionState) {
        let from = self.state();
        self.state.store(to.to_u8(), Ordering::SeqCst);
        tracing::info!(channel = self.channel_name, ?from, ?to, "connection state transition");
    }

    /// Disconnected -> Connecting, on `connect`.
    pub fn mark_connecting(&self) {
        self.transition(ConnectionState::Connecting);
    }

    /// Connecting -> Connected, once the outbound send side is acquired.
    pub fn mark_connected(&self) {
        self.transition(ConnectionState::Connected);
    }

    /// Connected -> Reconnecting, on transport error or explicit reconnect.
    pub fn mark_reconnecting(&self) {
        self.transition(ConnectionState::Reconnecting);
    }

    /// Any -> Disconnected, on explicit disconnect or factory shutdown.
    pub fn mark_disconnected(&self) {
        self.transition(ConnectionState::Disconnected);
    }

    /// Waits out the backoff interval, returning early if
    /// [`Self::schedule_immediate_reconnect`] is called meanwhile.
    pub async fn wait_backoff(&self) {
        tokio::select! {
            () = tokio::time::sleep(self.backoff) => {}
            () = self.immediate.notified() => {}
        }
    }

    /// Cuts short an in-progress backoff wait, triggering an immediate
    /// reconnect attempt.
    pub fn schedule_immediate_reconnect(&self) {
        self.immediate.notify_one();
    }

    /// Tells the driving loop to stop instead of reconnecting: sets the
    /// shutdown flag and wakes any in-progress backoff wait, so a
    /// disconnect requested mid-backoff takes effect immediately instead of
    /// waiting out the remaining interval first.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.immediate.notify_one();
    }

    /// Whether [`Self::request_shutdown`] has been called. The driving loop
    /// checks this before every connect/reconnect attempt.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_through_the_documented_transitions() {
        let supervisor = ReconnectSupervisor::new("test", Duration::from_secs(30));
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        supervisor.mark_connecting();
        assert_eq!(supervisor.state(), ConnectionState::Connecting);
        supervisor.mark_connected();
        assert!(supervisor.is_connected());
        supervisor.mark_reconnecting();
        assert_eq!(supervisor.state(), ConnectionState::Reconnecting);
        supervisor.mark_disconnected();
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn immediate_reconnect_cuts_backoff_short() {
        let supervisor = ReconnectSupervisor::new("test", Duration::from_secs(3600));
        supervisor.schedule_immediate_reconnect();
        tokio::time::timeout(Duration::from_millis(50), supervisor.wait_backoff())
            .await
            .expect("immediate reconnect should short-circuit the backoff sleep");
    }

    #[tokio::test]
    async fn shutdown_also_cuts_backoff_short_and_sticks() {
        let supervisor = ReconnectSupervisor::new("test", Duration::from_secs(3600));
        assert!(!supervisor.is_shutdown());
        supervisor.request_shutdown();
        assert!(supervisor.is_shutdown());
        tokio::time::timeout(Duration::from_millis(50), supervisor.wait_backoff())
            .await
            .expect("shutdown should short-circuit the backoff sleep");
    }
}
