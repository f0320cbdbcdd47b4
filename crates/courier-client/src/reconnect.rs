// Reconnection policy seam. When a stream dies because the routing server
// is unavailable, re-establishment is handed here instead of retried
// inline, so the retry cadence is the application's choice.
use std::time::Duration;

pub trait ReconnectScheduler: Send + Sync + 'static {
    /// Run `attempt` when the next reconnection should happen. Each stream
    /// failure schedules at most one attempt.
    fn schedule_retry(&self, attempt: Box<dyn FnOnce() + Send>);
}

/// Default policy: retry after a fixed delay on a spawned task.
pub struct FixedDelayScheduler {
    delay: Duration,
}

impl FixedDelayScheduler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for FixedDelayScheduler {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ReconnectScheduler for FixedDelayScheduler {
    fn schedule_retry(&self, attempt: Box<dyn FnOnce() + Send>) {
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            attempt();
        });
    }
}
