//! Wire-compatible message shapes for the `ackbus` request/response protocol.
//!
//! All messages are JSON documents. Requests are decoded into typed packets;
//! responses stay schemaless because handlers return arbitrary payloads.

pub mod packet;

pub use packet::{
    stamp_id, ErrorResponse, RequestPacket, ResponseStatus, NO_PATTERN_MESSAGE,
    WRAPPED_RESPONSE_KEY,
};
