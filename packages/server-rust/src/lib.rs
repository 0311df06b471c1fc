//! `ackbus` Server: request/response RPC over publish/subscribe transports.
//!
//! Callers publish `{ id, data }` on `<op>_ack`; the server invokes the
//! handler registered for `op` and publishes every result, stamped with the
//! request id, on `<op>_<id>_res`.

pub mod network;
pub mod server;
pub mod service;
pub mod traits;
pub mod transport;

pub use server::{RpcServer, ServerError};
pub use service::{handler_fn, HandlerError, HandlerOutput, MessageHandler, ServerConfig};
pub use traits::{ErrorSink, Session, TracingErrorSink, Transport};
pub use transport::{MemoryBroker, NatsTransport};
