// Client-facing error taxonomy.
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the bus APIs.
///
/// `Remote` is a failure reported by the far side of a request and is never
/// retried here; `ConnectionLost` is a transport-level failure that the
/// client heals from by reconnecting, failing only the requests that were
/// in flight when the stream died.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("connection to routing server lost")]
    ConnectionLost,
    #[error("remote failure {code}: {message}")]
    Remote { code: String, message: String },
    #[error("dispatch queue at capacity")]
    Overloaded,
    #[error("no local handler for {0}")]
    NoHandler(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("client is shut down")]
    Closed,
}

/// Error codes carried on failure responses back to the routing server.
pub mod error_codes {
    pub const NO_HANDLER: &str = "COURIER-4002";
    pub const EXECUTION_ERROR: &str = "COURIER-5001";
    pub const OVERLOADED: &str = "COURIER-4291";
    pub const CONNECTION_LOST: &str = "COURIER-1001";
}
