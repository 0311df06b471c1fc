//! ackbus-server: serves demo operations over a NATS broker.
//!
//! # Usage
//!
//! ```bash
//! ackbus-server --url nats://localhost:4222 --retry-attempts 5
//! ```
//!
//! Operations: `echo` returns its input, `sum` adds a list of numbers and
//! `count` streams `0..n`.

use std::time::Duration;

use ackbus_server::service::config::{
    DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY, DEFAULT_URL,
};
use ackbus_server::{handler_fn, HandlerError, HandlerOutput, NatsTransport, RpcServer, ServerConfig};
use anyhow::Context;
use clap::Parser;
use futures_util::stream;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ackbus-server")]
#[command(about = "Request/response RPC over NATS publish/subscribe")]
struct Args {
    /// Broker URL.
    #[arg(long, env = "ACKBUS_URL", default_value = DEFAULT_URL)]
    url: String,

    /// Consecutive reconnect attempts before a session gives up.
    #[arg(long, env = "ACKBUS_RETRY_ATTEMPTS", default_value_t = DEFAULT_RECONNECT_ATTEMPTS)]
    retry_attempts: u32,

    /// Delay between reconnect attempts, in milliseconds.
    #[arg(long, env = "ACKBUS_RETRY_DELAY_MS", default_value_t = default_delay_ms())]
    retry_delay_ms: u64,

    /// Client name announced to the broker.
    #[arg(long, env = "ACKBUS_NAME")]
    name: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "ACKBUS_LOG_JSON")]
    log_json: bool,
}

fn default_delay_ms() -> u64 {
    u64::try_from(DEFAULT_RECONNECT_DELAY.as_millis()).unwrap_or(u64::MAX)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn register_demo_handlers(server: &RpcServer) -> anyhow::Result<()> {
    server.add_handler("echo", handler_fn(|data: Value| async move { Ok(data) }))?;

    server.add_handler(
        "sum",
        handler_fn(|data: Value| async move {
            let numbers: Vec<f64> = serde_json::from_value(data)?;
            Ok::<_, HandlerError>(json!({ "sum": numbers.iter().sum::<f64>() }))
        }),
    )?;

    server.add_handler(
        "count",
        handler_fn(|data: Value| async move {
            let n = data
                .as_u64()
                .ok_or_else(|| HandlerError::InvalidArgument("expected a count".to_string()))?;
            Ok::<_, HandlerError>(HandlerOutput::stream(stream::iter(
                (0..n).map(|i| Ok(json!({ "n": i }))),
            )))
        }),
    )?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = ServerConfig {
        url: Some(args.url),
        retry_attempts: Some(args.retry_attempts),
        retry_delay: Some(Duration::from_millis(args.retry_delay_ms)),
        name: args.name,
    };
    let mut server = RpcServer::new(config, NatsTransport);
    register_demo_handlers(&server)?;

    server
        .listen(|| info!("ready to accept requests"))
        .await
        .context("failed to start listening")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    info!("shutting down");
    server.close();
    Ok(())
}
