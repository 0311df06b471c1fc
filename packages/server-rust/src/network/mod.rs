//! Broker sessions and their error reporting.

pub mod error_hook;
pub mod session;

pub use error_hook::attach_error_hook;
pub use session::{SessionPair, SessionRole};
