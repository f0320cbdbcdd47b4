// Worker pool draining the dispatch queue. Workers never die with a
// handler: every invocation is panic-isolated and every dequeued request
// gets an answer back to the server, success or not.
use courier_wire::Envelope;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::error::error_codes;
use crate::handler::{HandlerError, InProcessHandlers, LocalHandler};
use crate::queue::{InboundRequest, PriorityDispatchQueue};
use crate::session::StreamSession;
use crate::transport::Transport;

/// How responses for one request are shaped: a command resolves to exactly
/// one response, a query yields one response per handler followed by a
/// completion marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecutionMode {
    Command,
    Query,
}

pub(crate) fn spawn_workers<T: Transport>(
    count: usize,
    mode: ExecutionMode,
    queue: Arc<PriorityDispatchQueue>,
    handlers: Arc<InProcessHandlers>,
    session: StreamSession<T>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker| {
            let queue = Arc::clone(&queue);
            let handlers = Arc::clone(&handlers);
            let session = session.clone();
            tokio::spawn(async move {
                while let Some(request) = queue.dequeue().await {
                    metrics::histogram!("courier_client_queue_wait_seconds")
                        .record(request.received_at.elapsed().as_secs_f64());
                    execute(mode, request, &handlers, &session).await;
                }
                tracing::debug!(worker, "dispatch worker stopped");
            })
        })
        .collect()
}

async fn execute<T: Transport>(
    mode: ExecutionMode,
    request: InboundRequest,
    handlers: &InProcessHandlers,
    session: &StreamSession<T>,
) {
    let matched = handlers.handlers_for(&request.name);
    if matched.is_empty() {
        tracing::warn!(name = %request.name, request_id = %request.id, "no local handler");
        let response = Envelope::response_error(
            request.id.clone(),
            error_codes::NO_HANDLER,
            format!("no local handler for {}", request.name),
        );
        let _ = session.send_response(response).await;
        if mode == ExecutionMode::Query {
            let _ = session
                .send_response(Envelope::ResponseComplete {
                    request_id: request.id,
                })
                .await;
        }
        return;
    }
    match mode {
        ExecutionMode::Command => {
            // Additional command handlers for the same name are load-sharing
            // replicas; any one of them serves the request.
            let response = run_handler(&matched[0], &request);
            let _ = session.send_response(response).await;
        }
        ExecutionMode::Query => {
            for handler in &matched {
                let response = run_handler(handler, &request);
                let _ = session.send_response(response).await;
            }
            let _ = session
                .send_response(Envelope::ResponseComplete {
                    request_id: request.id,
                })
                .await;
        }
    }
}

fn run_handler(handler: &Arc<dyn LocalHandler>, request: &InboundRequest) -> Envelope {
    let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&request.payload)));
    match outcome {
        Ok(Ok(payload)) => Envelope::response_ok(request.id.clone(), payload),
        Ok(Err(HandlerError { message })) => {
            metrics::counter!("courier_client_handler_errors_total").increment(1);
            Envelope::response_error(request.id.clone(), error_codes::EXECUTION_ERROR, message)
        }
        Err(panic) => {
            metrics::counter!("courier_client_handler_panics_total").increment(1);
            let message = panic_message(&panic);
            tracing::error!(request_id = %request.id, message, "handler panicked");
            Envelope::response_error(request.id.clone(), error_codes::EXECUTION_ERROR, message)
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "handler panicked"
    }
}
