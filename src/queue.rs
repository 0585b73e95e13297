//! FIFO queue of pending requests.

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::request::Request;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
}

/// FIFO queue of [`Request`]s. Any number of pushers and poppers; a popped
/// request is delivered to exactly one caller.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Append a request to the tail. Fails once the queue is closed.
    fn push(&self, req: Request) -> Result<(), QueueError>;

    /// Remove the request at the head, waiting until one is available.
    /// Returns `None` once the queue is closed and drained.
    async fn pop(&self) -> Option<Request>;

    /// Number of requests currently queued.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting pushes. Queued requests remain poppable.
    fn close(&self);
}

type Hook = Box<dyn Fn(&Request) + Send + Sync>;

/// In-memory queue over an MPMC channel.
///
/// The `on_push`/`on_pop` observer hooks exist for tests that need to see
/// every enqueue (e.g. asserting a URL is never pushed twice).
pub struct MemQueue {
    tx: Mutex<Option<flume::Sender<Request>>>,
    rx: flume::Receiver<Request>,
    on_push: Mutex<Option<Hook>>,
    on_pop: Mutex<Option<Hook>>,
}

impl MemQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            on_push: Mutex::new(None),
            on_pop: Mutex::new(None),
        }
    }

    /// Install an observer invoked with every pushed request.
    pub fn set_on_push(&self, hook: impl Fn(&Request) + Send + Sync + 'static) {
        *self.on_push.lock() = Some(Box::new(hook));
    }

    /// Install an observer invoked with every popped request.
    pub fn set_on_pop(&self, hook: impl Fn(&Request) + Send + Sync + 'static) {
        *self.on_pop.lock() = Some(Box::new(hook));
    }
}

impl Default for MemQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for MemQueue {
    fn push(&self, req: Request) -> Result<(), QueueError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(QueueError::Closed)?;
        if let Some(hook) = self.on_push.lock().as_ref() {
            hook(&req);
        }
        tx.send(req).map_err(|_| QueueError::Closed)
    }

    async fn pop(&self) -> Option<Request> {
        let req = self.rx.recv_async().await.ok()?;
        if let Some(hook) = self.on_pop.lock().as_ref() {
            hook(&req);
        }
        Some(req)
    }

    fn len(&self) -> usize {
        self.rx.len()
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_order() {
        let q = MemQueue::new();
        q.push(Request::new("j", "http://a.local/1")).unwrap();
        q.push(Request::new("j", "http://a.local/2")).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().await.unwrap().url, "http://a.local/1");
        assert_eq!(q.pop().await.unwrap().url, "http://a.local/2");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let q = MemQueue::new();
        q.push(Request::new("j", "http://a.local/1")).unwrap();
        q.close();
        assert!(q.push(Request::new("j", "http://a.local/2")).is_err());
        assert!(q.pop().await.is_some());
        assert!(q.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_push_hook_observes_every_push() {
        let q = MemQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        q.set_on_push(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        q.push(Request::new("j", "http://a.local/1")).unwrap();
        q.push(Request::new("j", "http://a.local/2")).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exclusive_delivery() {
        let q = Arc::new(MemQueue::new());
        for i in 0..100 {
            q.push(Request::new("j", format!("http://a.local/{}", i))).unwrap();
        }
        q.close();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            handles.push(tokio::spawn(async move {
                let mut got = 0usize;
                while q.pop().await.is_some() {
                    got += 1;
                }
                got
            }));
        }
        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, 100);
    }
}
