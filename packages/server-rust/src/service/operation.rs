//! Handler results and their normalization into a response stream.
//!
//! A handler may answer with nothing, one value, a list of values or a lazy
//! stream. [`HandlerOutput::into_stream`] turns every shape into the same
//! finite stream of `Result<Value, HandlerError>`, which the dispatcher
//! drains and publishes item by item.

use std::fmt;

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;

/// Stream of response values produced by one handler invocation.
pub type ResponseStream = BoxStream<'static, Result<Value, HandlerError>>;

/// Errors returned by message handlers. The display text becomes the `err`
/// field of the error response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Shorthand for `HandlerError::Failed`.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

/// Everything a handler can return.
pub enum HandlerOutput {
    /// No response is published.
    Empty,
    /// Exactly one response.
    Value(Value),
    /// One response per element, in order.
    Many(Vec<Value>),
    /// One response per item, as the stream produces them.
    Stream(ResponseStream),
}

impl HandlerOutput {
    /// Wraps any stream of results.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, HandlerError>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    /// Normalizes into a lazy, finite stream of response values.
    #[must_use]
    pub fn into_stream(self) -> ResponseStream {
        match self {
            Self::Empty => stream::empty().boxed(),
            Self::Value(value) => stream::once(async move { Ok(value) }).boxed(),
            Self::Many(values) => stream::iter(values.into_iter().map(Ok)).boxed(),
            Self::Stream(stream) => stream,
        }
    }
}

impl fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Many(values) => f.debug_tuple("Many").field(values).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Value> for HandlerOutput {
    /// A JSON array is still one value; use `Vec<Value>` for several responses.
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Vec<Value>> for HandlerOutput {
    fn from(values: Vec<Value>) -> Self {
        Self::Many(values)
    }
}

impl From<Option<Value>> for HandlerOutput {
    fn from(value: Option<Value>) -> Self {
        value.map_or(Self::Empty, Self::Value)
    }
}

impl From<()> for HandlerOutput {
    fn from((): ()) -> Self {
        Self::Empty
    }
}
