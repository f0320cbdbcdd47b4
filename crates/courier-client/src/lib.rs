// Client-side routing endpoint for a distributed command/query bus.
// Dispatches outbound requests to a routing server and executes requests
// the server routes back, over long-lived bidirectional streams.
//
// DESIGN INTENT
// -------------
// Each message kind (commands, queries, query updates) rides its own
// stream, and each stream has exactly one receive loop. Everything that
// crosses a stream goes through bounded or purpose-built channels:
//
// - Inbound routed requests land in a bounded priority queue drained by a
//   fixed worker pool; a full queue rejects, it never blocks the receive
//   loop or silently drops work.
// - Flow control is credit-based: the client grants the server a permit
//   budget up front and refills it in batches as work completes, so the
//   server can never bury a slow client.
// - Streams are lazy and self-healing. They open on first use, replay the
//   subscription registry after every re-establishment, and fail only the
//   requests that were in flight when a stream died.
pub mod bus;
pub mod config;
pub mod error;
pub mod handler;
pub mod reconnect;
pub mod transport;
pub mod updates;

mod correlation;
mod flow;
mod queue;
mod registry;
mod session;
mod worker;

pub use bus::{CommandBus, QueryBus, Registration, ScatterGather, SubscriptionQuery};
pub use config::ClientConfig;
pub use error::{Error, Result, error_codes};
pub use handler::{HandlerError, InProcessHandlers, LocalHandler};
pub use reconnect::{FixedDelayScheduler, ReconnectScheduler};
pub use transport::{BidiStream, StreamEvent, Transport, TransportError};
pub use updates::SubscriptionUpdate;

pub use courier_wire as wire;
