// Credit-based flow control for one stream.
//
// The client grants the server a budget of data items; every consumed item
// shrinks the remaining budget, and crossing the low-water mark emits one
// refill grant sized to the configured batch. The counter is atomic so any
// worker thread can account consumption; the refill message itself is sent
// by the caller, never under a lock.
use courier_wire::{Envelope, MessageKind};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

#[derive(Debug, Clone)]
pub(crate) struct FlowConfig {
    pub initial: u64,
    pub batch: u64,
    pub threshold: u64,
}

pub(crate) struct FlowController {
    config: FlowConfig,
    remaining: AtomicI64,
    initial_sent: AtomicBool,
}

impl FlowController {
    pub(crate) fn new(config: FlowConfig) -> Self {
        let remaining = AtomicI64::new(config.initial as i64);
        Self {
            config,
            remaining,
            initial_sent: AtomicBool::new(false),
        }
    }

    /// The one-time opening grant for a fresh stream; `None` after the
    /// first call.
    pub(crate) fn initial_permits(&self) -> Option<u64> {
        if self.initial_sent.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(self.config.initial)
        }
    }

    /// Account `n` consumed data items. Returns the number of permits to
    /// grant when this call crossed the low-water mark; exactly one caller
    /// observes each crossing, no matter how many threads are accounting.
    pub(crate) fn mark_consumed(&self, n: u64) -> Option<u64> {
        let before = self.remaining.fetch_sub(n as i64, Ordering::AcqRel);
        let after = before - n as i64;
        let threshold = self.config.threshold as i64;
        if after <= threshold && before > threshold {
            self.remaining
                .fetch_add(self.config.batch as i64, Ordering::AcqRel);
            metrics::counter!("courier_client_flow_refills_total").increment(1);
            Some(self.config.batch)
        } else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }
}

/// Whether an outbound message accounts one consumed permit. Exactly one
/// outbound frame per routed request bears the permit: the single response
/// on a command stream, the terminal completion on a query stream (where a
/// request may produce many responses). Flow-control grants and
/// subscription control frames are free. (On the update stream the
/// permit-bearing items are the inbound update events, accounted in the
/// receive loop.)
pub(crate) fn permit_bearing(kind: MessageKind, outbound: &Envelope) -> bool {
    match kind {
        MessageKind::Command => matches!(outbound, Envelope::Response { .. }),
        MessageKind::Query => matches!(outbound, Envelope::ResponseComplete { .. }),
        MessageKind::QueryUpdate => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn controller(initial: u64, batch: u64, threshold: u64) -> FlowController {
        FlowController::new(FlowConfig {
            initial,
            batch,
            threshold,
        })
    }

    #[test]
    fn initial_permits_granted_once() {
        let flow = controller(100, 50, 50);
        assert_eq!(flow.initial_permits(), Some(100));
        assert_eq!(flow.initial_permits(), None);
    }

    #[test]
    fn refill_emitted_at_low_water_before_budget_exhausts() {
        let flow = controller(10, 5, 5);
        // Budget never reaches zero without a refill being emitted first.
        for i in 0..5 {
            let refill = flow.mark_consumed(1);
            if i < 4 {
                assert_eq!(refill, None, "no refill before the crossing");
            } else {
                assert_eq!(refill, Some(5), "refill exactly at the low-water mark");
            }
            assert!(flow.remaining() > 0);
        }
        assert_eq!(flow.remaining(), 10);
    }

    #[test]
    fn one_refill_per_crossing() {
        let flow = controller(10, 5, 5);
        let mut refills = 0;
        for _ in 0..20 {
            if flow.mark_consumed(1).is_some() {
                refills += 1;
            }
        }
        // 20 consumed against a 10-permit budget refilled in batches of 5:
        // crossings at remaining 5, 5, 5... after each batch restore.
        assert_eq!(refills, 4);
        assert!(flow.remaining() > 0);
    }

    #[test]
    fn one_outbound_frame_per_request_bears_the_permit() {
        let response = Envelope::response_ok("r-1", Some(Bytes::from_static(b"ok")));
        let complete = Envelope::ResponseComplete {
            request_id: "r-1".to_string(),
        };
        let control = Envelope::FlowControl { permits: 10 };
        assert!(permit_bearing(MessageKind::Command, &response));
        assert!(!permit_bearing(MessageKind::Command, &complete));
        assert!(permit_bearing(MessageKind::Query, &complete));
        assert!(!permit_bearing(MessageKind::Query, &response));
        assert!(!permit_bearing(MessageKind::Command, &control));
        assert!(!permit_bearing(MessageKind::QueryUpdate, &response));
    }
}
