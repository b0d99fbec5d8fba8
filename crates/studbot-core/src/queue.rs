//! Deferred work queue.
//!
//! Unbounded FIFO, shared between the intake side (enqueue on admission)
//! and a provider's executor loop (drain). Emptiness is a transient signal,
//! not closure: the consumer backs off briefly and polls again.

use std::collections::VecDeque;

use tokio::sync::Mutex;

pub struct WorkQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(&self, item: T) {
        self.inner.lock().await.push_back(item);
    }

    /// Pop the oldest item, or `None` while the queue is momentarily empty.
    pub async fn try_dequeue(&self) -> Option<T> {
        self.inner.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}
