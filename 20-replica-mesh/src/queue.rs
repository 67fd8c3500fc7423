//! FIFO queues between network tasks and the dispatch loops.
//!
//! Producers hold cheap clones of [`QueueSender`]; the single consumer owns
//! the [`QueueReceiver`]. Popping never treats an empty queue as an error.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::shutdown::Liveness;

pub fn queue<T>() -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueSender { tx }, QueueReceiver { rx })
}

#[derive(Debug)]
pub struct QueueSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Appends an item. Returns `false` once the consumer is gone.
    pub fn push(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }
}

/// Outcome of a timed pop.
#[derive(Debug, PartialEq, Eq)]
pub enum Pop<T> {
    Item(T),
    Empty,
    /// Every sender has been dropped and the queue is drained.
    Closed,
}

#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> QueueReceiver<T> {
    /// Non-blocking pop. `None` means the queue is currently empty.
    pub fn try_pop(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Waits up to `timeout` for the next item.
    pub async fn pop_timeout(&mut self, timeout: Duration) -> Pop<T> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(item)) => Pop::Item(item),
            Ok(None) => Pop::Closed,
            Err(_) => Pop::Empty,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Feeds every item to `handle` until shutdown or until all producers are gone.
///
/// An idle consumer wakes every `poll_interval` to notice shutdown, so exit
/// latency is bounded by it.
pub async fn drain<T>(
    name: &'static str,
    mut queue: QueueReceiver<T>,
    liveness: Liveness,
    poll_interval: Duration,
    mut handle: impl FnMut(T),
) {
    while liveness.is_alive() {
        match queue.pop_timeout(poll_interval).await {
            Pop::Item(item) => handle(item),
            Pop::Empty => {}
            Pop::Closed => break,
        }
    }
    debug!(consumer = name, "queue consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pops_in_push_order() {
        let (tx, mut rx) = queue();
        let other = tx.clone();
        assert!(tx.push(1));
        assert!(other.push(2));
        assert!(tx.push(3));

        assert_eq!(rx.len(), 3);
        assert_eq!(rx.try_pop(), Some(1));
        assert_eq!(rx.pop_timeout(Duration::from_millis(10)).await, Pop::Item(2));
        assert_eq!(rx.try_pop(), Some(3));
        assert_eq!(rx.try_pop(), None);
    }

    #[tokio::test]
    async fn empty_pop_times_out_then_reports_close() {
        let (tx, mut rx) = queue::<u8>();
        assert_eq!(rx.pop_timeout(Duration::from_millis(5)).await, Pop::Empty);

        drop(tx);
        assert_eq!(rx.pop_timeout(Duration::from_millis(5)).await, Pop::Closed);
    }

    #[tokio::test]
    async fn drain_stops_on_shutdown() {
        let (tx, rx) = queue();
        let liveness = Liveness::new();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        let task = {
            let liveness = liveness.clone();
            let seen = seen.clone();
            tokio::spawn(drain("test", rx, liveness, Duration::from_millis(5), move |item| {
                seen.lock().unwrap().push(item);
            }))
        };

        tx.push(1);
        tx.push(2);
        tokio::time::sleep(Duration::from_millis(30)).await;
        liveness.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("drain should stop")
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn push_fails_after_receiver_drops() {
        let (tx, rx) = queue();
        drop(rx);
        assert!(!tx.push("late"));
    }
}
