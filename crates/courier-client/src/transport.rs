// Transport boundary: how a stream to the routing server looks to the
// dispatch engine, independent of what carries it (QUIC, gRPC, TCP).
use courier_wire::{Envelope, MessageKind};
use std::future::Future;
use tokio::sync::mpsc;

/// Transport-level failures, classified so the session layer can decide
/// between immediate re-establishment and deferred backoff.
#[derive(thiserror::Error, Debug, Clone)]
pub enum TransportError {
    /// The routing server is down or unreachable; retrying immediately
    /// would hot-loop, so reconnection is handed to the backoff scheduler.
    #[error("routing server unavailable: {0}")]
    Unavailable(String),
    /// The stream failed for any other reason; a fresh stream is expected
    /// to work, so the session re-establishes right away.
    #[error("stream failed: {0}")]
    Stream(String),
}

impl TransportError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}

/// One inbound event on a stream. `Error` and `Closed` are terminal.
#[derive(Debug)]
pub enum StreamEvent {
    Message(Envelope),
    Error(TransportError),
    Closed,
}

/// One bidirectional stream. The outbound sender is the serialization
/// point: the transport must deliver what was sent, in send order, and
/// may be written to from multiple tasks.
pub struct BidiStream {
    pub outbound: mpsc::Sender<Envelope>,
    pub inbound: mpsc::Receiver<StreamEvent>,
}

/// Connection factory for the long-lived per-kind streams.
pub trait Transport: Send + Sync + 'static {
    fn open_stream(
        &self,
        kind: MessageKind,
    ) -> impl Future<Output = std::result::Result<BidiStream, TransportError>> + Send;
}
