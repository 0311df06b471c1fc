//! `ackbus` Core: channel naming and request/response wire messages.

pub mod channel;
pub mod messages;

pub use channel::{
    ack_channel, operation_from_ack_channel, response_channel, validate_operation_name,
    ChannelError,
};
pub use messages::{ErrorResponse, RequestPacket, ResponseStatus, NO_PATTERN_MESSAGE};
