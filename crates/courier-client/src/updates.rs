// Fan-out of subscription-query updates to their local consumers.
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::error_codes;

/// One event on a subscription query's update stream. The two completion
/// variants are terminal; nothing follows them.
#[derive(Debug, Clone)]
pub enum SubscriptionUpdate {
    Update(Bytes),
    Complete,
    CompleteExceptionally { code: String, message: String },
}

#[derive(Default)]
pub(crate) struct UpdateDispatcher {
    sinks: Mutex<HashMap<String, mpsc::UnboundedSender<SubscriptionUpdate>>>,
}

impl UpdateDispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, subscription_id: String) -> mpsc::UnboundedReceiver<SubscriptionUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sinks = self.sinks.lock().expect("updates lock poisoned");
        sinks.insert(subscription_id, tx);
        metrics::gauge!("courier_client_active_subscription_queries").set(sinks.len() as f64);
        rx
    }

    pub(crate) fn on_update(&self, subscription_id: &str, payload: Bytes) {
        let sinks = self.sinks.lock().expect("updates lock poisoned");
        match sinks.get(subscription_id) {
            Some(tx) => {
                let _ = tx.send(SubscriptionUpdate::Update(payload));
            }
            None => {
                tracing::debug!(subscription_id, "update for unknown subscription");
            }
        }
    }

    pub(crate) fn on_update_complete(&self, subscription_id: &str) {
        self.finish(subscription_id, SubscriptionUpdate::Complete);
    }

    pub(crate) fn on_update_complete_exceptionally(
        &self,
        subscription_id: &str,
        code: String,
        message: String,
    ) {
        self.finish(
            subscription_id,
            SubscriptionUpdate::CompleteExceptionally { code, message },
        );
    }

    /// Drop a sink without delivering a terminal event; the consumer side
    /// has cancelled. Returns whether the sink was still live.
    pub(crate) fn unregister(&self, subscription_id: &str) -> bool {
        let mut sinks = self.sinks.lock().expect("updates lock poisoned");
        let removed = sinks.remove(subscription_id).is_some();
        if removed {
            metrics::gauge!("courier_client_active_subscription_queries").set(sinks.len() as f64);
        }
        removed
    }

    /// The update stream died. Every active subscription query is ended
    /// exceptionally; updates that may have been emitted while disconnected
    /// are unobservable, so staying silently subscribed would be a lie.
    pub(crate) fn on_disconnect(&self) {
        let drained: Vec<(String, mpsc::UnboundedSender<SubscriptionUpdate>)> = {
            let mut sinks = self.sinks.lock().expect("updates lock poisoned");
            let drained = sinks.drain().collect();
            metrics::gauge!("courier_client_active_subscription_queries").set(0.0);
            drained
        };
        if !drained.is_empty() {
            tracing::warn!(count = drained.len(), "ending subscription queries on disconnect");
        }
        for (_, tx) in drained {
            let _ = tx.send(SubscriptionUpdate::CompleteExceptionally {
                code: error_codes::CONNECTION_LOST.to_string(),
                message: "connection to routing server lost".to_string(),
            });
        }
    }

    fn finish(&self, subscription_id: &str, terminal: SubscriptionUpdate) {
        let mut sinks = self.sinks.lock().expect("updates lock poisoned");
        if let Some(tx) = sinks.remove(subscription_id) {
            let _ = tx.send(terminal);
            metrics::gauge!("courier_client_active_subscription_queries").set(sinks.len() as f64);
        }
    }

    #[cfg(test)]
    pub(crate) fn active_len(&self) -> usize {
        self.sinks.lock().expect("updates lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn updates_flow_until_complete() {
        let dispatcher = UpdateDispatcher::new();
        let mut rx = dispatcher.register("sub-1".to_string());
        dispatcher.on_update("sub-1", Bytes::from_static(b"a"));
        dispatcher.on_update_complete("sub-1");
        assert!(matches!(
            rx.recv().await,
            Some(SubscriptionUpdate::Update(_))
        ));
        assert!(matches!(rx.recv().await, Some(SubscriptionUpdate::Complete)));
        assert!(rx.recv().await.is_none());
        assert_eq!(dispatcher.active_len(), 0);
    }

    #[tokio::test]
    async fn completion_is_terminal() {
        let dispatcher = UpdateDispatcher::new();
        let mut rx = dispatcher.register("sub-1".to_string());
        dispatcher.on_update_complete("sub-1");
        // Late events after completion go nowhere.
        dispatcher.on_update("sub-1", Bytes::from_static(b"late"));
        dispatcher.on_update_complete_exceptionally(
            "sub-1",
            "X".to_string(),
            "late".to_string(),
        );
        assert!(matches!(rx.recv().await, Some(SubscriptionUpdate::Complete)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn disconnect_ends_all_exceptionally() {
        let dispatcher = UpdateDispatcher::new();
        let mut rx1 = dispatcher.register("sub-1".to_string());
        let mut rx2 = dispatcher.register("sub-2".to_string());
        dispatcher.on_disconnect();
        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await {
                Some(SubscriptionUpdate::CompleteExceptionally { code, .. }) => {
                    assert_eq!(code, error_codes::CONNECTION_LOST);
                }
                other => panic!("unexpected event: {other:?}"),
            }
            assert!(rx.recv().await.is_none());
        }
    }
}
