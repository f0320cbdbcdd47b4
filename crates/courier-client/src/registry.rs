// Reference-counted registry of names this client handles. It is the
// source of truth replayed to the server after every stream
// re-establishment.
use courier_wire::Envelope;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// A subscription is keyed by the routed name plus, for queries, the
/// declared result type. Commands leave `result_name` empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SubscriptionKey {
    pub(crate) name: String,
    pub(crate) result_name: Option<String>,
}

pub(crate) struct SubscriptionRegistry {
    component_id: String,
    counts: Mutex<HashMap<SubscriptionKey, usize>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new(component_id: String) -> Self {
        Self {
            component_id,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Register one handler; returns the new count for the key.
    pub(crate) fn add(&self, key: SubscriptionKey) -> usize {
        let mut counts = self.counts.lock().expect("registry lock poisoned");
        let count = {
            let entry = counts.entry(key).or_insert(0);
            *entry += 1;
            *entry
        };
        metrics::gauge!("courier_client_subscriptions").set(counts.len() as f64);
        count
    }

    /// Drop one handler; returns the remaining count, or `None` when the
    /// key was not registered (a stale cancel is a no-op).
    pub(crate) fn remove(&self, key: &SubscriptionKey) -> Option<usize> {
        let mut counts = self.counts.lock().expect("registry lock poisoned");
        let remaining = match counts.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                counts.remove(key);
                0
            }
            None => return None,
        };
        metrics::gauge!("courier_client_subscriptions").set(counts.len() as f64);
        Some(remaining)
    }

    /// Current registrations with handler counts, for replay after a
    /// stream re-establishment.
    pub(crate) fn snapshot(&self) -> Vec<(SubscriptionKey, usize)> {
        let counts = self.counts.lock().expect("registry lock poisoned");
        counts
            .iter()
            .map(|(key, count)| (key.clone(), *count))
            .collect()
    }

    pub(crate) fn subscribe_message(&self, key: &SubscriptionKey, handler_count: usize) -> Envelope {
        Envelope::Subscribe {
            name: key.name.clone(),
            result_name: key.result_name.clone(),
            component_id: self.component_id.clone(),
            handler_count: handler_count as u32,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// `remaining` is the handler count left after the removal; the server
    /// drops its routing entry only at zero.
    pub(crate) fn unsubscribe_message(&self, key: &SubscriptionKey, remaining: usize) -> Envelope {
        Envelope::Unsubscribe {
            name: key.name.clone(),
            result_name: key.result_name.clone(),
            component_id: self.component_id.clone(),
            handler_count: remaining as u32,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn count(&self, key: &SubscriptionKey) -> usize {
        self.counts
            .lock()
            .expect("registry lock poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> SubscriptionKey {
        SubscriptionKey {
            name: name.to_string(),
            result_name: None,
        }
    }

    #[test]
    fn counts_track_add_and_remove() {
        let registry = SubscriptionRegistry::new("comp".to_string());
        assert_eq!(registry.add(key("order.place")), 1);
        assert_eq!(registry.add(key("order.place")), 2);
        assert_eq!(registry.remove(&key("order.place")), Some(1));
        assert_eq!(registry.remove(&key("order.place")), Some(0));
        assert_eq!(registry.remove(&key("order.place")), None);
        assert_eq!(registry.count(&key("order.place")), 0);
    }

    #[test]
    fn query_keys_distinguish_result_name() {
        let registry = SubscriptionRegistry::new("comp".to_string());
        let by_id = SubscriptionKey {
            name: "order.find".to_string(),
            result_name: Some("Order".to_string()),
        };
        let summary = SubscriptionKey {
            name: "order.find".to_string(),
            result_name: Some("OrderSummary".to_string()),
        };
        registry.add(by_id.clone());
        registry.add(summary.clone());
        assert_eq!(registry.count(&by_id), 1);
        assert_eq!(registry.count(&summary), 1);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn subscribe_message_carries_component_and_count() {
        let registry = SubscriptionRegistry::new("comp".to_string());
        let message = registry.subscribe_message(&key("order.place"), 3);
        match message {
            Envelope::Subscribe {
                name,
                component_id,
                handler_count,
                ..
            } => {
                assert_eq!(name, "order.place");
                assert_eq!(component_id, "comp");
                assert_eq!(handler_count, 3);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unsubscribe_message_carries_remaining_count() {
        let registry = SubscriptionRegistry::new("comp".to_string());
        registry.add(key("order.place"));
        registry.add(key("order.place"));
        let remaining = registry.remove(&key("order.place")).expect("registered");
        match registry.unsubscribe_message(&key("order.place"), remaining) {
            Envelope::Unsubscribe { handler_count, .. } => assert_eq!(handler_count, 1),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
