// Public bus surfaces: command dispatch and the three query shapes
// (point-to-point, scatter-gather, subscription query), plus local handler
// registration.
use bytes::Bytes;
use courier_wire::{Envelope, MessageKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::correlation::{CorrelationTracker, SingleResult};
use crate::error::{Error, Result};
use crate::handler::{InProcessHandlers, LocalHandler};
use crate::queue::PriorityDispatchQueue;
use crate::reconnect::ReconnectScheduler;
use crate::registry::{SubscriptionKey, SubscriptionRegistry};
use crate::session::StreamSession;
use crate::transport::Transport;
use crate::updates::{SubscriptionUpdate, UpdateDispatcher};
use crate::worker::{spawn_workers, ExecutionMode};

/// Handle for one registered handler. Dropping it leaves the handler
/// registered; call [`Registration::cancel`] to unregister.
pub struct Registration {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Registration {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unregister the handler. The server is told the remaining handler
    /// count; it drops its routing entry when that reaches zero.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

// Teardown frames are best-effort. Cancels and drops may run outside any
// runtime, where there is no live stream to notify either.
fn spawn_send(future: impl std::future::Future<Output = ()> + Send + 'static) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(future);
    }
}

struct CommandInner<T: Transport> {
    session: StreamSession<T>,
    registry: Arc<SubscriptionRegistry>,
    correlation: Arc<CorrelationTracker>,
    handlers: Arc<InProcessHandlers>,
    queue: Arc<PriorityDispatchQueue>,
}

/// Routing endpoint for commands: dispatch outbound, execute inbound.
///
/// Must be created inside a tokio runtime; the worker pool is spawned at
/// construction and the carrying stream opens lazily on first use.
pub struct CommandBus<T: Transport> {
    inner: Arc<CommandInner<T>>,
}

impl<T: Transport> Clone for CommandBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> CommandBus<T> {
    pub fn new(
        transport: Arc<T>,
        config: &ClientConfig,
        scheduler: Arc<dyn ReconnectScheduler>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(config.component_id.clone()));
        let correlation = Arc::new(CorrelationTracker::new());
        let queue = Arc::new(PriorityDispatchQueue::new(config.queue_capacity));
        let handlers = Arc::new(InProcessHandlers::new());
        let session = StreamSession::new(
            transport,
            MessageKind::Command,
            config.flow(),
            Arc::clone(&registry),
            Arc::clone(&correlation),
            Some(Arc::clone(&queue)),
            None,
            scheduler,
        );
        spawn_workers(
            config.command_workers,
            ExecutionMode::Command,
            Arc::clone(&queue),
            Arc::clone(&handlers),
            session.clone(),
        );
        Self {
            inner: Arc::new(CommandInner {
                session,
                registry,
                correlation,
                handlers,
                queue,
            }),
        }
    }

    /// Send a command and wait for its single result. `Ok(None)` means the
    /// far side completed the command without a result payload.
    pub async fn dispatch(
        &self,
        name: impl Into<String>,
        payload: Bytes,
        priority: i64,
    ) -> Result<Option<Bytes>> {
        let id = Uuid::new_v4().to_string();
        let rx = self.inner.correlation.register_single(id.clone());
        let request = Envelope::Request {
            id: id.clone(),
            name: name.into(),
            priority,
            payload,
        };
        if let Err(err) = self.inner.session.send_data(request).await {
            self.inner.correlation.discard(&id);
            return Err(err);
        }
        metrics::counter!("courier_client_commands_dispatched_total").increment(1);
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionLost),
        }
    }

    /// Register a local command handler. The server learns of the
    /// registration immediately when a stream is open, or on the replay
    /// that accompanies the next establishment.
    pub async fn subscribe(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn LocalHandler>,
    ) -> Registration {
        let name = name.into();
        let key = SubscriptionKey {
            name: name.clone(),
            result_name: None,
        };
        self.inner.handlers.register(name.clone(), Arc::clone(&handler));
        let count = self.inner.registry.add(key.clone());
        let message = self.inner.registry.subscribe_message(&key, count);
        if let Err(err) = self.inner.session.send_subscription_change(message).await {
            tracing::warn!(name = %key.name, error = %err, "subscribe not yet announced");
        }
        let inner = Arc::clone(&self.inner);
        Registration::new(move || {
            inner.handlers.unregister(&key.name, &handler);
            if let Some(remaining) = inner.registry.remove(&key) {
                let message = inner.registry.unsubscribe_message(&key, remaining);
                let session = inner.session.clone();
                spawn_send(async move {
                    let _ = session.send_if_open(message).await;
                });
            }
        })
    }

    /// Tear the endpoint down: announce every registration as gone, stop
    /// accepting routed work, and drain the worker pool.
    pub async fn disconnect(&self) {
        self.inner.session.unsubscribe_all().await;
        self.inner.handlers.clear();
        self.inner.queue.close();
        self.inner.session.close();
    }
}

struct QueryInner<T: Transport> {
    session: StreamSession<T>,
    update_session: StreamSession<T>,
    registry: Arc<SubscriptionRegistry>,
    correlation: Arc<CorrelationTracker>,
    handlers: Arc<InProcessHandlers>,
    queue: Arc<PriorityDispatchQueue>,
    updates: Arc<UpdateDispatcher>,
}

/// Routing endpoint for queries. Point-to-point and scatter-gather share
/// one stream; live subscription-query updates ride a dedicated stream so
/// a burst of updates cannot starve query responses.
pub struct QueryBus<T: Transport> {
    inner: Arc<QueryInner<T>>,
}

impl<T: Transport> Clone for QueryBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> QueryBus<T> {
    pub fn new(
        transport: Arc<T>,
        config: &ClientConfig,
        scheduler: Arc<dyn ReconnectScheduler>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(config.component_id.clone()));
        let correlation = Arc::new(CorrelationTracker::new());
        let queue = Arc::new(PriorityDispatchQueue::new(config.queue_capacity));
        let handlers = Arc::new(InProcessHandlers::new());
        let updates = Arc::new(UpdateDispatcher::new());
        let session = StreamSession::new(
            Arc::clone(&transport),
            MessageKind::Query,
            config.flow(),
            Arc::clone(&registry),
            Arc::clone(&correlation),
            Some(Arc::clone(&queue)),
            None,
            Arc::clone(&scheduler),
        );
        // The update stream carries no subscriptions or request/response
        // traffic of its own.
        let update_session = StreamSession::new(
            transport,
            MessageKind::QueryUpdate,
            config.flow(),
            Arc::new(SubscriptionRegistry::new(config.component_id.clone())),
            Arc::new(CorrelationTracker::new()),
            None,
            Some(Arc::clone(&updates)),
            scheduler,
        );
        spawn_workers(
            config.query_workers,
            ExecutionMode::Query,
            Arc::clone(&queue),
            Arc::clone(&handlers),
            session.clone(),
        );
        Self {
            inner: Arc::new(QueryInner {
                session,
                update_session,
                registry,
                correlation,
                handlers,
                queue,
                updates,
            }),
        }
    }

    /// Point-to-point query: first response wins, remaining handlers on the
    /// far side are not consulted. `Ok(None)` means the query completed
    /// without any response.
    pub async fn query(&self, name: impl Into<String>, payload: Bytes) -> Result<Option<Bytes>> {
        let id = Uuid::new_v4().to_string();
        let rx = self.inner.correlation.register_single(id.clone());
        let request = Envelope::Request {
            id: id.clone(),
            name: name.into(),
            priority: 0,
            payload,
        };
        if let Err(err) = self.inner.session.send_data(request).await {
            self.inner.correlation.discard(&id);
            return Err(err);
        }
        metrics::counter!("courier_client_queries_dispatched_total").increment(1);
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionLost),
        }
    }

    /// Fan a query out to every remote handler and stream the responses
    /// back until the server declares completion or the deadline passes.
    pub async fn scatter_gather(
        &self,
        name: impl Into<String>,
        payload: Bytes,
        deadline: Duration,
    ) -> Result<ScatterGather> {
        let id = Uuid::new_v4().to_string();
        let rx = self.inner.correlation.register_collector(id.clone());
        let request = Envelope::Request {
            id: id.clone(),
            name: name.into(),
            priority: 0,
            payload,
        };
        if let Err(err) = self.inner.session.send_data(request).await {
            self.inner.correlation.discard(&id);
            return Err(err);
        }
        metrics::counter!("courier_client_scatter_gathers_total").increment(1);
        Ok(ScatterGather {
            id,
            correlation: Arc::clone(&self.inner.correlation),
            rx,
            deadline: tokio::time::Instant::now() + deadline,
            done: false,
        })
    }

    /// Query once, then keep receiving updates until the server completes
    /// the subscription or it is cancelled. The update sink is registered
    /// before the subscription is announced, so no update can be missed.
    pub async fn subscription_query(
        &self,
        name: impl Into<String>,
        payload: Bytes,
    ) -> Result<SubscriptionQuery> {
        let name = name.into();
        let subscription_id = Uuid::new_v4().to_string();
        let rx = self.inner.updates.register(subscription_id.clone());
        let request = Envelope::SubscriptionRequest {
            subscription_id: subscription_id.clone(),
            name: name.clone(),
            payload: payload.clone(),
        };
        if let Err(err) = self.inner.update_session.send_data(request).await {
            self.inner.updates.unregister(&subscription_id);
            return Err(err);
        }
        let initial = match self.query(name, payload).await {
            Ok(initial) => initial,
            Err(err) => {
                self.cancel_subscription(&subscription_id);
                return Err(err);
            }
        };
        let inner = Arc::clone(&self.inner);
        let cancel_id = subscription_id.clone();
        Ok(SubscriptionQuery {
            initial,
            rx,
            cancel: Some(Box::new(move || {
                if inner.updates.unregister(&cancel_id) {
                    let message = Envelope::SubscriptionCancel {
                        subscription_id: cancel_id,
                    };
                    let session = inner.update_session.clone();
                    spawn_send(async move {
                        let _ = session.send_if_open(message).await;
                    });
                }
            })),
        })
    }

    /// Register a local query handler. `result_name` is the declared result
    /// type; the same query name may be served with different result types
    /// by different handlers.
    pub async fn subscribe(
        &self,
        name: impl Into<String>,
        result_name: impl Into<String>,
        handler: Arc<dyn LocalHandler>,
    ) -> Registration {
        let name = name.into();
        let key = SubscriptionKey {
            name: name.clone(),
            result_name: Some(result_name.into()),
        };
        self.inner.handlers.register(name, Arc::clone(&handler));
        let count = self.inner.registry.add(key.clone());
        let message = self.inner.registry.subscribe_message(&key, count);
        if let Err(err) = self.inner.session.send_subscription_change(message).await {
            tracing::warn!(name = %key.name, error = %err, "subscribe not yet announced");
        }
        let inner = Arc::clone(&self.inner);
        Registration::new(move || {
            inner.handlers.unregister(&key.name, &handler);
            if let Some(remaining) = inner.registry.remove(&key) {
                let message = inner.registry.unsubscribe_message(&key, remaining);
                let session = inner.session.clone();
                spawn_send(async move {
                    let _ = session.send_if_open(message).await;
                });
            }
        })
    }

    /// Tear the endpoint down: announce registrations as gone, end every
    /// live subscription query, stop accepting routed work, and drain the
    /// worker pool.
    pub async fn disconnect(&self) {
        self.inner.session.unsubscribe_all().await;
        self.inner.handlers.clear();
        self.inner.queue.close();
        self.inner.updates.on_disconnect();
        self.inner.session.close();
        self.inner.update_session.close();
    }

    fn cancel_subscription(&self, subscription_id: &str) {
        if self.inner.updates.unregister(subscription_id) {
            let message = Envelope::SubscriptionCancel {
                subscription_id: subscription_id.to_string(),
            };
            let session = self.inner.update_session.clone();
            spawn_send(async move {
                let _ = session.send_if_open(message).await;
            });
        }
    }
}

/// Streaming results of a scatter-gather query. Ends when the server
/// declares completion or the deadline passes; the deadline ends the
/// stream quietly, it is not an error.
pub struct ScatterGather {
    id: String,
    correlation: Arc<CorrelationTracker>,
    rx: mpsc::UnboundedReceiver<SingleResult>,
    deadline: tokio::time::Instant,
    done: bool,
}

impl ScatterGather {
    pub async fn next(&mut self) -> Option<Result<Bytes>> {
        if self.done {
            return None;
        }
        loop {
            match tokio::time::timeout_at(self.deadline, self.rx.recv()).await {
                Ok(Some(Ok(Some(payload)))) => return Some(Ok(payload)),
                // A responder that completed without a payload contributes
                // nothing to the gathered results.
                Ok(Some(Ok(None))) => continue,
                Ok(Some(Err(err))) => {
                    self.finish();
                    return Some(Err(err));
                }
                Ok(None) => {
                    self.finish();
                    return None;
                }
                Err(_) => {
                    self.finish();
                    return None;
                }
            }
        }
    }

    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.correlation.discard(&self.id);
        }
    }
}

impl Drop for ScatterGather {
    fn drop(&mut self) {
        self.finish();
    }
}

/// A live subscription query: the initial result plus the stream of
/// updates. Dropping it cancels the subscription.
pub struct SubscriptionQuery {
    /// Result of the initial query, resolved before updates are consumed.
    pub initial: Option<Bytes>,
    rx: mpsc::UnboundedReceiver<SubscriptionUpdate>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionQuery {
    /// Next update, or `None` once a terminal event has been delivered.
    pub async fn next_update(&mut self) -> Option<SubscriptionUpdate> {
        self.rx.recv().await
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for SubscriptionQuery {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
