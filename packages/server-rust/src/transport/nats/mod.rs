//! Minimal NATS client transport: text protocol over TCP with JSON payloads.

pub mod client;
pub mod codec;

pub use client::{parse_address, NatsSession, NatsTransport, DEFAULT_PORT};
pub use codec::{
    validate_subject, ClientOp, CodecError, ConnectInfo, NatsCodec, ServerInfo, ServerOp,
    DEFAULT_MAX_PAYLOAD,
};
