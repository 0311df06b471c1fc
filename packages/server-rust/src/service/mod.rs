//! Request handling pipeline.
//!
//! 1. **Registry** (`registry`): operation name -> `MessageHandler`
//! 2. **Binding** (`binder`): one `<op>_ack` subscription per registered operation
//! 3. **Dispatch** (`dispatcher`): decode, invoke, normalize the result
//! 4. **Publishing** (`publisher`): id-stamped responses on `<op>_<id>_res`

pub mod binder;
pub mod config;
pub mod dispatcher;
pub mod operation;
pub mod publisher;
pub mod registry;

// Re-export key types for convenient access.
pub use binder::SubscriptionBinder;
pub use config::ServerConfig;
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use operation::{HandlerError, HandlerOutput, ResponseStream};
pub use publisher::{make_publisher, ResponsePublisher};
pub use registry::{handler_fn, FnHandler, HandlerRegistry, MessageHandler};
