//! The outbound stream holder.
//!
//! A single-cell reference to the currently authoritative send side of a
//! channel's bidi stream, swapped atomically on (re)connect. Producer
//! threads calling `send` concurrently are serialized here, since the
//! underlying stream's own `send` is assumed non-thread-safe.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::ConnectorError;

/// The send side of an open bidi stream for frame type `F`.
///
/// A real binding implements this over a `tonic`-generated client/server
/// streaming handle. A real binding lives outside this crate.
#[async_trait]
pub trait OutboundSink<F>: Send + Sync {
    /// Sends one frame. Errors are treated as a local dispatch failure by
    /// callers; they do not themselves trigger reconnection (the incoming
    /// stream's termination is the authoritative transport-loss signal).
    async fn send(&self, frame: F) -> Result<(), ConnectorError>;

    /// Sends an orderly end-of-stream marker. Best-effort: errors are
    /// logged by callers, never propagated.
    async fn close(&self);
}

/// Single-cell holder for the authoritative outbound sink of one channel.
pub struct OutboundHolder<F> {
    current: Mutex<Option<Arc<dyn OutboundSink<F>>>>,
}

impl<F> Default for OutboundHolder<F> {
    fn default() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }
}

impl<F> OutboundHolder<F> {
    /// Builds an empty holder (no stream installed).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently installed sink, if any.
    #[must_use]
    pub fn get(&self) -> Option<Arc<dyn OutboundSink<F>>> {
        self.current.lock().clone()
    }

    /// Installs `new`, returning whatever was previously installed.
    pub fn get_and_set(&self, new: Option<Arc<dyn OutboundSink<F>>>) -> Option<Arc<dyn OutboundSink<F>>> {
        std::mem::replace(&mut *self.current.lock(), new)
    }

    /// Installs `new` only if the cell still holds `expected` (compared by
    /// pointer identity). Returns whether the swap happened.
    pub fn compare_and_swap(
        &self,
        expected: Option<&Arc<dyn OutboundSink<F>>>,
        new: Option<Arc<dyn OutboundSink<F>>>,
    ) -> bool {
        let mut guard = self.current.lock();
        let matches = match (guard.as_ref(), expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => Arc::ptr_eq(current, expected),
            _ => false,
        };
        if matches {
            *guard = new;
        }
        matches
    }

    /// Sends `frame` on the currently installed sink, failing with
    /// [`ConnectorError::LocalDispatch`] if none is installed.
    pub async fn send(&self, channel: &'static str, frame: F) -> Result<(), ConnectorError> {
        let sink = self.get().ok_or_else(|| ConnectorError::LocalDispatch {
            category: crate::error::ErrorCategory::new(
                crate::error::ErrorCategory::COMMAND_DISPATCH_ERROR,
            ),
            message: format!("no active outbound stream for {channel} channel"),
        })?;
        sink.send(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingSink {
        sent: AsyncMutex<Vec<u32>>,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl OutboundSink<u32> for RecordingSink {
        async fn send(&self, frame: u32) -> Result<(), ConnectorError> {
            self.sent.lock().await.push(frame);
            Ok(())
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn send_without_installed_sink_fails_locally() {
        let holder: OutboundHolder<u32> = OutboundHolder::new();
        let err = holder.send("command", 1).await.unwrap_err();
        assert!(matches!(err, ConnectorError::LocalDispatch { .. }));
    }

    #[tokio::test]
    async fn swap_replaces_the_authoritative_sink() {
        let holder: OutboundHolder<u32> = OutboundHolder::new();
        let first = Arc::new(RecordingSink {
            sent: AsyncMutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
        });
        let second = Arc::new(RecordingSink {
            sent: AsyncMutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
        });

        holder.get_and_set(Some(first.clone() as Arc<dyn OutboundSink<u32>>));
        holder.send("command", 1).await.unwrap();

        let previous = holder.get_and_set(Some(second.clone() as Arc<dyn OutboundSink<u32>>));
        if let Some(previous) = previous {
            previous.close().await;
        }
        holder.send("command", 2).await.unwrap();

        assert_eq!(*first.sent.lock().await, vec![1]);
        assert_eq!(*second.sent.lock().await, vec![2]);
        assert_eq!(first.closed.load(Ordering::SeqCst), 1);
    }
}
