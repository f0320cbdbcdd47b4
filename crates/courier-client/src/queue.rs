// Bounded priority queue between the stream receive loop and the worker
// pool. Higher declared priority dequeues first; equal priorities dequeue
// in arrival order.
use bytes::Bytes;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// A routed request received from the server, waiting for local execution.
#[derive(Debug)]
pub(crate) struct InboundRequest {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) priority: i64,
    pub(crate) payload: Bytes,
    pub(crate) received_at: Instant,
    pub(crate) seq: u64,
}

struct QueuedItem {
    request: InboundRequest,
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.request.priority == other.request.priority && self.request.seq == other.request.seq
    }
}

impl Eq for QueuedItem {}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority wins; for equal priority the lower
        // sequence number (earlier arrival) wins.
        self.request
            .priority
            .cmp(&other.request.priority)
            .then_with(|| other.request.seq.cmp(&self.request.seq))
    }
}

struct Inner {
    heap: BinaryHeap<QueuedItem>,
    next_seq: u64,
    closed: bool,
}

pub(crate) struct PriorityDispatchQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl PriorityDispatchQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue without blocking the receive loop. A full queue rejects with
    /// `Overloaded` so the caller can report local overload to the server;
    /// items are never silently dropped.
    pub(crate) fn try_enqueue(&self, mut request: InboundRequest) -> Result<()> {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.closed {
                return Err(Error::Closed);
            }
            if inner.heap.len() >= self.capacity {
                metrics::counter!("courier_client_queue_overload_total").increment(1);
                return Err(Error::Overloaded);
            }
            request.seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(QueuedItem { request });
            metrics::gauge!("courier_client_queue_depth").set(inner.heap.len() as f64);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Next request by (priority desc, arrival asc), or `None` once the
    /// queue is closed and drained. Waiters are woken by `close`, so idle
    /// workers observe shutdown promptly.
    pub(crate) async fn dequeue(&self) -> Option<InboundRequest> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so an enqueue between the
            // check and the await cannot be missed.
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if let Some(item) = inner.heap.pop() {
                    metrics::gauge!("courier_client_queue_depth").set(inner.heap.len() as f64);
                    return Some(item.request);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub(crate) fn close(&self) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, priority: i64) -> InboundRequest {
        InboundRequest {
            id: id.to_string(),
            name: "test".to_string(),
            priority,
            payload: Bytes::new(),
            received_at: Instant::now(),
            seq: 0,
        }
    }

    #[tokio::test]
    async fn dequeues_by_priority_then_arrival() {
        let queue = PriorityDispatchQueue::new(16);
        queue.try_enqueue(request("item1", 1)).expect("enqueue");
        queue.try_enqueue(request("item2", 5)).expect("enqueue");
        queue.try_enqueue(request("item3", 3)).expect("enqueue");
        queue.try_enqueue(request("item4", 5)).expect("enqueue");

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(queue.dequeue().await.expect("item").id);
        }
        assert_eq!(order, vec!["item2", "item4", "item3", "item1"]);
    }

    #[tokio::test]
    async fn rejects_when_full() {
        let queue = PriorityDispatchQueue::new(2);
        queue.try_enqueue(request("a", 1)).expect("enqueue");
        queue.try_enqueue(request("b", 1)).expect("enqueue");
        let err = queue.try_enqueue(request("c", 1)).expect_err("full");
        assert!(matches!(err, Error::Overloaded));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn close_wakes_idle_dequeuers() {
        let queue = std::sync::Arc::new(PriorityDispatchQueue::new(4));
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        let item = waiter.await.expect("join");
        assert!(item.is_none());
    }

    #[tokio::test]
    async fn drains_remaining_items_after_close() {
        let queue = PriorityDispatchQueue::new(4);
        queue.try_enqueue(request("a", 1)).expect("enqueue");
        queue.close();
        assert!(queue.dequeue().await.is_some());
        assert!(queue.dequeue().await.is_none());
    }
}
