//! The buffered result stream.
//!
//! A producer/consumer buffer with bounded credit: the consumer is credited
//! `initial_permits` up front, each delivered element consumes one, and once
//! `refill_batch` elements have been consumed the stream emits a
//! flow-control frame back upstream (a no-op hook if the underlying
//! transport is unary and has no such frame). Completion is signalled by a
//! dedicated terminal variant rather than a sentinel element value, which
//! keeps `T` from needing a reserved "this one means done" value.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::ConnectorError;
use crate::permit::FlowControlGovernor;

enum Item<T> {
    Value(T),
    Error(ConnectorError),
    Terminal,
}

/// The producer half, held by whatever is forwarding an open RPC's results
/// into the buffer.
pub struct BufferedResultProducer<T> {
    tx: mpsc::Sender<Item<T>>,
}

impl<T> BufferedResultProducer<T> {
    /// Forwards one element to the consumer. Returns `Err` if the consumer
    /// has been dropped or [`BufferedResultStream::close`]d.
    pub async fn push(&self, value: T) -> Result<(), ()> {
        self.tx.send(Item::Value(value)).await.map_err(|_| ())
    }

    /// Records a terminal error, raised on the consumer's next read.
    pub async fn fail(&self, cause: ConnectorError) {
        let _ = self.tx.send(Item::Error(cause)).await;
    }

    /// Signals normal completion.
    pub async fn complete(&self) {
        let _ = self.tx.send(Item::Terminal).await;
    }
}

/// The consumer half: a bounded, back-pressured [`Stream`] of `T`.
pub struct BufferedResultStream<T> {
    rx: mpsc::Receiver<Item<T>>,
    governor: FlowControlGovernor,
    on_refill: Box<dyn Fn(u32) + Send + Sync>,
    done: bool,
    detached: bool,
}

/// Builds a connected producer/consumer pair.
///
/// `initial_permits` sizes the bounded channel (and is the credit the
/// consumer starts with); `refill_batch` is how many consumed elements
/// trigger `on_refill`, which a caller wires up to send an actual
/// flow-control frame upstream.
pub fn buffered_result_stream<T: Send + 'static>(
    initial_permits: u32,
    refill_batch: u32,
    on_refill: impl Fn(u32) + Send + Sync + 'static,
) -> (BufferedResultProducer<T>, BufferedResultStream<T>) {
    let capacity = initial_permits.max(1) as usize;
    let (tx, rx) = mpsc::channel(capacity);
    (
        BufferedResultProducer { tx },
        BufferedResultStream {
            rx,
            governor: FlowControlGovernor::new(refill_batch.max(1)),
            on_refill: Box::new(on_refill),
            done: false,
            detached: false,
        },
    )
}

impl<T> BufferedResultStream<T> {
    /// Detaches the consumer without cancelling whatever produces into it
    /// (used for one-way streams where the caller no longer wants results
    /// but the RPC itself should keep running to completion).
    pub fn close(&mut self) {
        self.detached = true;
        self.rx.close();
    }
}

impl<T: Unpin> Stream for BufferedResultStream<T> {
    type Item = Result<T, ConnectorError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done || this.detached {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Item::Value(value))) => {
                if let Some(batch) = this.governor.consume_one() {
                    (this.on_refill)(batch);
                }
                Poll::Ready(Some(Ok(value)))
            }
            Poll::Ready(Some(Item::Error(cause))) => {
                this.done = true;
                Poll::Ready(Some(Err(cause)))
            }
            Poll::Ready(Some(Item::Terminal)) | Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn yields_values_then_terminates_on_complete() {
        let (producer, mut stream) = buffered_result_stream::<u32>(8, 4, |_| {});
        producer.push(1).await.unwrap();
        producer.push(2).await.unwrap();
        producer.complete().await;

        assert_eq!(stream.next().await, Some(Ok(1)));
        assert_eq!(stream.next().await, Some(Ok(2)));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn surfaces_error_then_terminates() {
        let (producer, mut stream) = buffered_result_stream::<u32>(8, 4, |_| {});
        producer.push(1).await.unwrap();
        producer
            .fail(ConnectorError::Disconnected)
            .await;

        assert_eq!(stream.next().await, Some(Ok(1)));
        assert!(matches!(stream.next().await, Some(Err(ConnectorError::Disconnected))));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn refill_hook_fires_on_batch_boundary() {
        let refills = Arc::new(AtomicU32::new(0));
        let refills_clone = refills.clone();
        let (producer, mut stream) =
            buffered_result_stream::<u32>(8, 2, move |batch| {
                refills_clone.fetch_add(batch, Ordering::SeqCst);
            });
        for i in 0..5 {
            producer.push(i).await.unwrap();
        }
        producer.complete().await;
        while stream.next().await.is_some() {}
        assert_eq!(refills.load(Ordering::SeqCst), 4); // two refills of batch=2
    }

    #[tokio::test]
    async fn close_detaches_without_further_yields() {
        let (producer, mut stream) = buffered_result_stream::<u32>(8, 4, |_| {});
        producer.push(1).await.unwrap();
        stream.close();
        assert_eq!(stream.next().await, None);
    }
}
