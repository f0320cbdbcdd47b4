// Pending-request tracking. Every in-flight request id maps to exactly one
// resolution slot; removing the entry from the map IS the resolution, so a
// response can never complete the same request twice.
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;

pub(crate) type SingleResult = Result<Option<Bytes>, Error>;

enum Pending {
    /// One response resolves the request (commands, point-to-point queries).
    Single(oneshot::Sender<SingleResult>),
    /// Many responses stream into a collector until completion or failure
    /// (scatter-gather).
    Collector(mpsc::UnboundedSender<SingleResult>),
}

#[derive(Default)]
pub(crate) struct CorrelationTracker {
    pending: Mutex<HashMap<String, Pending>>,
}

impl CorrelationTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register_single(&self, id: String) -> oneshot::Receiver<SingleResult> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().expect("correlation lock poisoned");
        pending.insert(id, Pending::Single(tx));
        metrics::gauge!("courier_client_pending_requests").set(pending.len() as f64);
        rx
    }

    pub(crate) fn register_collector(&self, id: String) -> mpsc::UnboundedReceiver<SingleResult> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pending = self.pending.lock().expect("correlation lock poisoned");
        pending.insert(id, Pending::Collector(tx));
        metrics::gauge!("courier_client_pending_requests").set(pending.len() as f64);
        rx
    }

    /// Deliver one response. A single-shot entry is consumed; a collector
    /// entry stays registered until `on_complete` or `discard`.
    pub(crate) fn on_response(&self, id: &str, result: SingleResult) {
        let mut pending = self.pending.lock().expect("correlation lock poisoned");
        match pending.get(id) {
            Some(Pending::Single(_)) => {
                if let Some(Pending::Single(tx)) = pending.remove(id) {
                    let _ = tx.send(result);
                }
                metrics::gauge!("courier_client_pending_requests").set(pending.len() as f64);
            }
            Some(Pending::Collector(tx)) => {
                let _ = tx.send(result);
            }
            None => {
                tracing::debug!(request_id = id, "response for unknown or settled request");
            }
        }
    }

    /// The far side declared the request finished. A collector's channel is
    /// dropped so the consumer sees end-of-stream; an unresolved single-shot
    /// request resolves to `Ok(None)` (completed without a response).
    pub(crate) fn on_complete(&self, id: &str) {
        let mut pending = self.pending.lock().expect("correlation lock poisoned");
        if let Some(entry) = pending.remove(id) {
            if let Pending::Single(tx) = entry {
                let _ = tx.send(Ok(None));
            }
            metrics::gauge!("courier_client_pending_requests").set(pending.len() as f64);
        }
    }

    /// Drop an entry without resolving it; the waiter side has given up.
    pub(crate) fn discard(&self, id: &str) {
        let mut pending = self.pending.lock().expect("correlation lock poisoned");
        if pending.remove(id).is_some() {
            metrics::gauge!("courier_client_pending_requests").set(pending.len() as f64);
        }
    }

    /// Fail every in-flight request. Called when the carrying stream dies:
    /// whatever was pending on it will never get an answer.
    pub(crate) fn fail_all(&self, make_error: impl Fn() -> Error) {
        let drained: Vec<(String, Pending)> = {
            let mut pending = self.pending.lock().expect("correlation lock poisoned");
            let drained = pending.drain().collect();
            metrics::gauge!("courier_client_pending_requests").set(0.0);
            drained
        };
        if !drained.is_empty() {
            tracing::warn!(count = drained.len(), "failing in-flight requests");
        }
        for (_, entry) in drained {
            match entry {
                Pending::Single(tx) => {
                    let _ = tx.send(Err(make_error()));
                }
                Pending::Collector(tx) => {
                    let _ = tx.send(Err(make_error()));
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().expect("correlation lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_resolves_once() {
        let tracker = CorrelationTracker::new();
        let rx = tracker.register_single("req-1".to_string());
        tracker.on_response("req-1", Ok(Some(Bytes::from_static(b"a"))));
        // A second response for the same id is a no-op.
        tracker.on_response("req-1", Ok(Some(Bytes::from_static(b"b"))));
        let result = rx.await.expect("resolved");
        assert_eq!(result.expect("ok"), Some(Bytes::from_static(b"a")));
        assert_eq!(tracker.pending_len(), 0);
    }

    #[tokio::test]
    async fn complete_without_response_yields_none() {
        let tracker = CorrelationTracker::new();
        let rx = tracker.register_single("req-1".to_string());
        tracker.on_complete("req-1");
        assert_eq!(rx.await.expect("resolved").expect("ok"), None);
    }

    #[tokio::test]
    async fn collector_receives_all_until_complete() {
        let tracker = CorrelationTracker::new();
        let mut rx = tracker.register_collector("req-1".to_string());
        tracker.on_response("req-1", Ok(Some(Bytes::from_static(b"a"))));
        tracker.on_response("req-1", Ok(Some(Bytes::from_static(b"b"))));
        tracker.on_complete("req-1");
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none(), "channel closes on completion");
    }

    #[tokio::test]
    async fn fail_all_drains_every_entry() {
        let tracker = CorrelationTracker::new();
        let rx_single = tracker.register_single("req-1".to_string());
        let mut rx_collect = tracker.register_collector("req-2".to_string());
        tracker.fail_all(|| Error::ConnectionLost);
        assert!(matches!(
            rx_single.await.expect("resolved"),
            Err(Error::ConnectionLost)
        ));
        assert!(matches!(
            rx_collect.recv().await,
            Some(Err(Error::ConnectionLost))
        ));
        assert_eq!(tracker.pending_len(), 0);
    }
}
