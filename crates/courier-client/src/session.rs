// One long-lived stream to the routing server, re-established on failure.
//
// The session is lazy: no stream exists until the first send needs one.
// Opening is single-flight behind an async gate, and every open stream is
// tagged with an epoch so a receive loop that outlives its stream cannot
// tear down a successor.
use courier_wire::{Envelope, MessageKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

use crate::correlation::CorrelationTracker;
use crate::error::{error_codes, Error, Result};
use crate::flow::{permit_bearing, FlowConfig, FlowController};
use crate::queue::{InboundRequest, PriorityDispatchQueue};
use crate::reconnect::ReconnectScheduler;
use crate::registry::SubscriptionRegistry;
use crate::transport::{StreamEvent, Transport, TransportError};
use crate::updates::UpdateDispatcher;

#[derive(Clone)]
pub(crate) struct StreamHandle {
    outbound: mpsc::Sender<Envelope>,
    flow: Arc<FlowController>,
    epoch: u64,
}

impl StreamHandle {
    async fn send(&self, message: Envelope) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| Error::ConnectionLost)
    }
}

struct SessionInner<T: Transport> {
    transport: Arc<T>,
    kind: MessageKind,
    flow_config: FlowConfig,
    registry: Arc<SubscriptionRegistry>,
    correlation: Arc<CorrelationTracker>,
    queue: Option<Arc<PriorityDispatchQueue>>,
    updates: Option<Arc<UpdateDispatcher>>,
    scheduler: Arc<dyn ReconnectScheduler>,
    current: Mutex<Option<StreamHandle>>,
    open_gate: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
    closed: AtomicBool,
}

pub(crate) struct StreamSession<T: Transport> {
    inner: Arc<SessionInner<T>>,
}

impl<T: Transport> Clone for StreamSession<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> StreamSession<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: Arc<T>,
        kind: MessageKind,
        flow_config: FlowConfig,
        registry: Arc<SubscriptionRegistry>,
        correlation: Arc<CorrelationTracker>,
        queue: Option<Arc<PriorityDispatchQueue>>,
        updates: Option<Arc<UpdateDispatcher>>,
        scheduler: Arc<dyn ReconnectScheduler>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                transport,
                kind,
                flow_config,
                registry,
                correlation,
                queue,
                updates,
                scheduler,
                current: Mutex::new(None),
                open_gate: tokio::sync::Mutex::new(()),
                epoch: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn current_handle(&self) -> Option<StreamHandle> {
        self.inner
            .current
            .lock()
            .expect("session lock poisoned")
            .clone()
    }

    /// The open stream, establishing one if needed. Establishment sends the
    /// opening flow grant and replays every registered subscription before
    /// the handle is handed out.
    pub(crate) async fn get_or_open(&self) -> Result<StreamHandle> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if let Some(handle) = self.current_handle() {
            return Ok(handle);
        }
        let _gate = self.inner.open_gate.lock().await;
        if let Some(handle) = self.current_handle() {
            return Ok(handle);
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let stream = self.inner.transport.open_stream(self.inner.kind).await?;
        let epoch = self.inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let handle = StreamHandle {
            outbound: stream.outbound,
            flow: Arc::new(FlowController::new(self.inner.flow_config.clone())),
            epoch,
        };
        if let Some(permits) = handle.flow.initial_permits() {
            handle.send(Envelope::FlowControl { permits }).await?;
        }
        *self.inner.current.lock().expect("session lock poisoned") = Some(handle.clone());
        let session = self.clone();
        let loop_handle = handle.clone();
        tokio::spawn(async move {
            session.run_receive_loop(stream.inbound, loop_handle).await;
        });
        self.resubscribe_all(&handle).await;
        metrics::counter!("courier_client_streams_opened_total", "kind" => self.inner.kind.as_str())
            .increment(1);
        tracing::info!(kind = self.inner.kind.as_str(), epoch, "stream established");
        Ok(handle)
    }

    /// Send a data message, opening the stream if needed.
    pub(crate) async fn send_data(&self, message: Envelope) -> Result<()> {
        let handle = self.get_or_open().await?;
        handle.send(message).await
    }

    /// Send a subscription change for a key that was just registered. With
    /// no stream open, opening one is enough: establishment replays the
    /// registry, which already holds the new key.
    pub(crate) async fn send_subscription_change(&self, message: Envelope) -> Result<()> {
        if let Some(handle) = self.current_handle() {
            return handle.send(message).await;
        }
        self.get_or_open().await.map(|_| ())
    }

    /// Send only if a stream is currently open; used for teardown traffic
    /// that must not establish a stream just to say goodbye.
    pub(crate) async fn send_if_open(&self, message: Envelope) -> Result<()> {
        match self.current_handle() {
            Some(handle) => handle.send(message).await,
            None => Ok(()),
        }
    }

    /// Send one response produced by the worker pool, accounting it against
    /// the server's permit budget and granting a refill at the low-water
    /// mark.
    pub(crate) async fn send_response(&self, message: Envelope) -> Result<()> {
        let Some(handle) = self.current_handle() else {
            tracing::debug!(kind = self.inner.kind.as_str(), "dropping response, stream gone");
            return Ok(());
        };
        self.send_response_on(&handle, message).await
    }

    /// Best-effort unsubscribe for everything in the registry, over the
    /// current stream if one is open. The registry itself is not touched.
    pub(crate) async fn unsubscribe_all(&self) {
        let Some(handle) = self.current_handle() else {
            return;
        };
        for (key, _) in self.inner.registry.snapshot() {
            if handle
                .send(self.inner.registry.unsubscribe_message(&key, 0))
                .await
                .is_err()
            {
                break;
            }
        }
    }

    /// Stop the session. No new streams open after this; the current one is
    /// dropped, which closes its outbound side.
    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner
            .current
            .lock()
            .expect("session lock poisoned")
            .take();
    }

    async fn resubscribe_all(&self, handle: &StreamHandle) {
        let snapshot = self.inner.registry.snapshot();
        if snapshot.is_empty() {
            return;
        }
        tracing::info!(
            kind = self.inner.kind.as_str(),
            count = snapshot.len(),
            "replaying subscriptions"
        );
        for (key, count) in snapshot {
            if handle
                .send(self.inner.registry.subscribe_message(&key, count))
                .await
                .is_err()
            {
                tracing::warn!(
                    kind = self.inner.kind.as_str(),
                    "subscription replay interrupted"
                );
                break;
            }
        }
    }

    async fn run_receive_loop(self, mut inbound: mpsc::Receiver<StreamEvent>, handle: StreamHandle) {
        let error = loop {
            match inbound.recv().await {
                Some(StreamEvent::Message(message)) => {
                    self.route_inbound(message, &handle).await;
                }
                Some(StreamEvent::Error(err)) => break Some(err),
                Some(StreamEvent::Closed) | None => break None,
            }
        };
        self.on_terminated(handle.epoch, error);
    }

    async fn route_inbound(&self, message: Envelope, handle: &StreamHandle) {
        match message {
            Envelope::Request {
                id,
                name,
                priority,
                payload,
            } => {
                let Some(queue) = &self.inner.queue else {
                    tracing::warn!(
                        kind = self.inner.kind.as_str(),
                        "request on a non-request stream"
                    );
                    return;
                };
                let request = InboundRequest {
                    id: id.clone(),
                    name,
                    priority,
                    payload,
                    received_at: Instant::now(),
                    seq: 0,
                };
                if let Err(err) = queue.try_enqueue(request) {
                    // A rejected request still consumed a permit and still
                    // owes the server an answer.
                    tracing::warn!(request_id = %id, error = %err, "rejecting routed request");
                    let response = Envelope::response_error(
                        id.clone(),
                        error_codes::OVERLOADED,
                        err.to_string(),
                    );
                    let _ = self.send_response_on(handle, response).await;
                    if self.inner.kind == MessageKind::Query {
                        let complete = Envelope::ResponseComplete { request_id: id };
                        let _ = self.send_response_on(handle, complete).await;
                    }
                }
            }
            Envelope::Response {
                request_id,
                payload,
                error,
            } => {
                let result = match error {
                    Some(info) => Err(Error::Remote {
                        code: info.code,
                        message: info.message,
                    }),
                    None => Ok(payload),
                };
                self.inner.correlation.on_response(&request_id, result);
            }
            Envelope::ResponseComplete { request_id } => {
                self.inner.correlation.on_complete(&request_id);
            }
            Envelope::UpdateEvent {
                subscription_id,
                payload,
            } => {
                if let Some(updates) = &self.inner.updates {
                    updates.on_update(&subscription_id, payload);
                }
                if let Some(permits) = handle.flow.mark_consumed(1) {
                    let _ = handle.send(Envelope::FlowControl { permits }).await;
                }
            }
            Envelope::UpdateComplete { subscription_id } => {
                if let Some(updates) = &self.inner.updates {
                    updates.on_update_complete(&subscription_id);
                }
            }
            Envelope::UpdateCompleteExceptionally {
                subscription_id,
                error,
            } => {
                if let Some(updates) = &self.inner.updates {
                    updates.on_update_complete_exceptionally(
                        &subscription_id,
                        error.code,
                        error.message,
                    );
                }
            }
            other => {
                tracing::debug!(
                    kind = self.inner.kind.as_str(),
                    message = ?other,
                    "unexpected inbound"
                );
            }
        }
    }

    async fn send_response_on(&self, handle: &StreamHandle, message: Envelope) -> Result<()> {
        let bearing = permit_bearing(self.inner.kind, &message);
        handle.send(message).await?;
        if bearing && let Some(permits) = handle.flow.mark_consumed(1) {
            handle.send(Envelope::FlowControl { permits }).await?;
        }
        Ok(())
    }

    /// A receive loop finished. Only the loop belonging to the current
    /// stream tears state down; a stale loop waking up late is ignored.
    fn on_terminated(&self, epoch: u64, error: Option<TransportError>) {
        {
            let mut current = self.inner.current.lock().expect("session lock poisoned");
            match current.as_ref() {
                Some(handle) if handle.epoch == epoch => {
                    current.take();
                }
                _ => return,
            }
        }
        metrics::counter!("courier_client_stream_failures_total", "kind" => self.inner.kind.as_str())
            .increment(1);
        tracing::warn!(
            kind = self.inner.kind.as_str(),
            epoch,
            error = ?error,
            "stream terminated"
        );
        self.inner.correlation.fail_all(|| Error::ConnectionLost);
        if let Some(updates) = &self.inner.updates {
            updates.on_disconnect();
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        // A dead server makes an immediate retry a hot loop; anything else
        // is worth one straight re-establishment.
        if error.as_ref().is_some_and(TransportError::is_unavailable) {
            self.schedule_reconnect();
        } else {
            self.spawn_reconnect();
        }
    }

    /// One reconnection attempt. Failure goes back to the scheduler rather
    /// than being dropped: a handler-only client has no outbound traffic to
    /// trigger a lazy reopen, so the retry chain is its only way back.
    fn spawn_reconnect(&self) {
        let session = self.clone();
        tokio::spawn(async move {
            match session.get_or_open().await {
                Ok(_) | Err(Error::Closed) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "reconnection attempt failed");
                    session.schedule_reconnect();
                }
            }
        });
    }

    fn schedule_reconnect(&self) {
        let session = self.clone();
        self.inner
            .scheduler
            .schedule_retry(Box::new(move || session.spawn_reconnect()));
    }
}
