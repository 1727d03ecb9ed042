//! Bounded single-producer/single-consumer handoff.
//!
//! Overflow policy is drop-newest: when the queue is full the incoming item is
//! rejected and handed back to the caller, already-queued items are untouched.
//! Closing is producer-only and idempotent; the consumer still drains whatever
//! was queued before it observes closure.
//!
//! Neither half is `Clone`, so there is exactly one writer and one reader.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Capacity used between the generator and the publisher.
pub const DEFAULT_CAPACITY: usize = 1_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnqueueError<T> {
    #[error("queue is full")]
    Full(T),
    #[error("queue is closed for writes")]
    Closed(T),
}

impl<T> EnqueueError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }
}

/// Outcome of waiting for the queue without consuming from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Closed,
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Dequeued<T> {
    Item(T),
    Closed,
    Cancelled,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    readable: Notify,
}

/// Create a queue holding at most `capacity` items (minimum 1).
pub fn bounded<T>(capacity: usize) -> (QueueWriter<T>, QueueReader<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            items: VecDeque::with_capacity(capacity),
            closed: false,
        }),
        capacity,
        readable: Notify::new(),
    });
    (
        QueueWriter {
            shared: Arc::clone(&shared),
        },
        QueueReader { shared },
    )
}

/// Producer half. Dropping it closes the queue.
pub struct QueueWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> QueueWriter<T> {
    /// Non-blocking enqueue; the rejected item is returned inside the error.
    pub fn try_enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(EnqueueError::Closed(item));
            }
            if state.items.len() >= self.shared.capacity {
                return Err(EnqueueError::Full(item));
            }
            state.items.push_back(item);
        }
        self.shared.readable.notify_one();
        Ok(())
    }

    /// `true` if the item was accepted, `false` if it was dropped.
    pub fn enqueue(&self, item: T) -> bool {
        self.try_enqueue(item).is_ok()
    }

    /// Mark the queue closed for writes. Calling it again has no effect.
    pub fn close(&self) {
        let newly_closed = {
            let mut state = self.shared.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        if newly_closed {
            self.shared.readable.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Drop for QueueWriter<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer half.
pub struct QueueReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> QueueReader<T> {
    /// Suspend until an item is available, the queue is closed and drained,
    /// or `cancel` fires. Nothing is consumed.
    pub async fn wait_readable(&mut self, cancel: &CancellationToken) -> Readiness {
        loop {
            if cancel.is_cancelled() {
                return Readiness::Cancelled;
            }
            {
                let state = self.shared.state.lock();
                if !state.items.is_empty() {
                    return Readiness::Ready;
                }
                if state.closed {
                    return Readiness::Closed;
                }
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Readiness::Cancelled,
                () = self.shared.readable.notified() => {}
            }
        }
    }

    /// Take the oldest item if one is immediately available.
    pub fn try_dequeue(&mut self) -> Option<T> {
        self.shared.state.lock().items.pop_front()
    }

    /// Suspend until an item can be taken, the queue is closed and drained,
    /// or `cancel` fires.
    pub async fn dequeue(&mut self, cancel: &CancellationToken) -> Dequeued<T> {
        loop {
            match self.wait_readable(cancel).await {
                Readiness::Ready => {
                    if let Some(item) = self.try_dequeue() {
                        return Dequeued::Item(item);
                    }
                }
                Readiness::Closed => return Dequeued::Closed,
                Readiness::Cancelled => return Dequeued::Cancelled,
            }
        }
    }

    /// `true` once the producer closed the queue and every item was taken.
    pub fn is_closed(&self) -> bool {
        let state = self.shared.state.lock();
        state.closed && state.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn drain<T>(reader: &mut QueueReader<T>) -> Vec<T> {
        std::iter::from_fn(|| reader.try_dequeue()).collect()
    }

    #[test]
    fn items_dequeue_in_enqueue_order() {
        let (writer, mut reader) = bounded(8);
        for i in 0..8 {
            assert!(writer.enqueue(i));
        }
        assert_eq!(drain(&mut reader), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn capacity_two_rejects_third_item() {
        let (writer, mut reader) = bounded(2);
        assert!(writer.enqueue("a"));
        assert!(writer.enqueue("b"));
        assert!(!writer.enqueue("c"));
        assert_eq!(drain(&mut reader), vec!["a", "b"]);
    }

    #[test]
    fn overflow_keeps_earliest_items_and_rejects_the_rest() {
        let capacity = 5;
        let (writer, mut reader) = bounded(capacity);
        let mut rejected = Vec::new();
        for i in 0..12 {
            if let Err(err) = writer.try_enqueue(i) {
                assert!(matches!(err, EnqueueError::Full(_)));
                rejected.push(err.into_inner());
            }
        }
        assert_eq!(drain(&mut reader), vec![0, 1, 2, 3, 4]);
        assert_eq!(rejected, (5..12).collect::<Vec<_>>());
    }

    #[test]
    fn space_freed_by_dequeue_is_reusable() {
        let (writer, mut reader) = bounded(1);
        assert!(writer.enqueue(1));
        assert!(!writer.enqueue(2));
        assert_eq!(reader.try_dequeue(), Some(1));
        assert!(writer.enqueue(3));
        assert_eq!(reader.try_dequeue(), Some(3));
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let (writer, _reader) = bounded::<u8>(0);
        assert_eq!(writer.capacity(), 1);
        assert!(writer.enqueue(1));
        assert!(!writer.enqueue(2));
    }

    #[test]
    fn enqueue_after_close_is_rejected() {
        let (writer, _reader) = bounded(4);
        writer.close();
        assert_eq!(writer.try_enqueue(7), Err(EnqueueError::Closed(7)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_queued_items_still_drain() {
        let (writer, mut reader) = bounded(4);
        let cancel = CancellationToken::new();
        writer.enqueue(1);
        writer.enqueue(2);
        writer.close();
        writer.close();
        writer.close();

        assert_eq!(reader.dequeue(&cancel).await, Dequeued::Item(1));
        assert_eq!(reader.dequeue(&cancel).await, Dequeued::Item(2));
        assert_eq!(reader.dequeue(&cancel).await, Dequeued::Closed);
        assert_eq!(reader.dequeue(&cancel).await, Dequeued::Closed);
        assert!(reader.is_closed());
    }

    #[tokio::test]
    async fn dropping_writer_closes_queue() {
        let (writer, mut reader) = bounded::<u8>(4);
        drop(writer);
        let cancel = CancellationToken::new();
        assert_eq!(reader.wait_readable(&cancel).await, Readiness::Closed);
    }

    #[tokio::test]
    async fn wait_readable_does_not_consume() {
        let (writer, mut reader) = bounded(4);
        let cancel = CancellationToken::new();
        writer.enqueue(9);
        assert_eq!(reader.wait_readable(&cancel).await, Readiness::Ready);
        assert_eq!(reader.wait_readable(&cancel).await, Readiness::Ready);
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.try_dequeue(), Some(9));
    }

    #[tokio::test]
    async fn blocked_reader_wakes_on_enqueue() {
        let (writer, mut reader) = bounded(4);
        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(async move { reader.dequeue(&cancel).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());
        writer.enqueue("late");

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("reader should wake")
            .unwrap();
        assert_eq!(got, Dequeued::Item("late"));
    }

    #[tokio::test]
    async fn blocked_reader_wakes_on_close() {
        let (writer, mut reader) = bounded::<u8>(4);
        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(async move { reader.dequeue(&cancel).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.close();

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("reader should observe closure")
            .unwrap();
        assert_eq!(got, Dequeued::Closed);
    }

    #[tokio::test]
    async fn cancellation_unblocks_reader_and_wins_over_items() {
        let (writer, mut reader) = bounded(4);
        let cancel = CancellationToken::new();
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let first = reader.dequeue(&cancel).await;
                (first, reader)
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let (first, mut reader) = waiter.await.unwrap();
        assert_eq!(first, Dequeued::Cancelled);

        writer.enqueue(1);
        assert_eq!(reader.dequeue(&cancel).await, Dequeued::Cancelled);
        assert_eq!(reader.try_dequeue(), Some(1));
    }

    #[tokio::test]
    async fn producer_and_consumer_tasks_preserve_order() {
        let (writer, mut reader) = bounded(16);
        let cancel = CancellationToken::new();
        let producer = tokio::spawn(async move {
            let mut sent = Vec::new();
            for i in 0..500u32 {
                if writer.enqueue(i) {
                    sent.push(i);
                }
                if i % 7 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            sent
        });

        let mut received = Vec::new();
        while let Dequeued::Item(item) = reader.dequeue(&cancel).await {
            received.push(item);
        }

        let sent = producer.await.unwrap();
        assert_eq!(received, sent);
    }
}
