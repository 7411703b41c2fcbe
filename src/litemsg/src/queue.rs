use crossbeam::channel::{self, Receiver, Sender};
use std::time::Duration;

/// An unbounded FIFO with a blocking `dequeue`.
///
/// This is the only structure handed across threads inside a node. Any number
/// of producers and consumers may share it through an `Arc`.
#[derive(Debug)]
pub struct HandoffQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandoffQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        HandoffQueue { tx, rx }
    }

    /// Appends an item and wakes one waiter. Never blocks.
    pub fn enqueue(&self, item: T) {
        // both ends live in self, the channel cannot be disconnected
        let _ = self.tx.send(item);
    }

    /// Blocks until an item is available.
    pub fn dequeue(&self) -> T {
        loop {
            if let Ok(item) = self.rx.recv() {
                return item;
            }
        }
    }

    /// Like [`dequeue`](Self::dequeue) but gives up after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Drops every queued item.
    pub fn clear(&self) {
        for _ in self.rx.try_iter() {}
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
