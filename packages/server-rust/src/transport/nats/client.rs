//! NATS session with a background connection driver.
//!
//! `NatsTransport::connect` returns immediately; a spawned driver task owns
//! the TCP connection. It performs the `CONNECT` handshake, replays every
//! subscription after each (re)connect, reports `Connected` only once the
//! server answers the handshake `PING`, forwards queued publishes, answers
//! server `PING`s and routes `MSG`s to subscriptions by sid. When the
//! connection drops it retries up to `max_reconnect_attempts` times, waiting
//! `reconnect_delay` between attempts, then closes the session.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::codec::{validate_subject, ClientOp, ConnectInfo, NatsCodec, ServerOp};
use crate::traits::{Session, Transport};
use crate::transport::{
    ConnectOptions, Delivery, SessionSignals, SessionState, Subscription, TransportError,
};

/// Port used when the URL does not name one.
pub const DEFAULT_PORT: u16 = 4222;

/// How long the server may take to answer the handshake `PING`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves a broker URL (`nats://host:port`, `tcp://host`, `host:port`) to
/// a socket address string.
///
/// # Errors
///
/// Returns `TransportError::InvalidUrl` for an unsupported scheme, a missing
/// host or an unparsable port.
pub fn parse_address(url: &str) -> Result<String, TransportError> {
    let invalid = |reason: &str| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let rest = match url.split_once("://") {
        Some(("nats" | "tcp", rest)) => rest,
        Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme {scheme:?}"))),
        None => url,
    };
    // Credentials and paths are not supported; drop them.
    let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
    let rest = rest.split('/').next().unwrap_or_default();

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>().map_err(|_| invalid("invalid port"))?,
        ),
        None => (rest, DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    Ok(format!("{host}:{port}"))
}

/// NATS transport. Each `connect` opens an independent TCP connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsTransport;

impl Transport for NatsTransport {
    fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn Session>, TransportError> {
        let address = parse_address(&options.url)?;
        let (commands, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            signals: SessionSignals::new(SessionState::Connecting),
            subscriptions: DashMap::new(),
            max_payload: AtomicU64::new(0),
        });

        let driver = Driver {
            address,
            options: options.clone(),
            shared: Arc::clone(&shared),
            commands: rx,
            shutdown: shutdown_rx,
        };
        tokio::spawn(driver.run());

        Ok(Arc::new(NatsSession {
            shared,
            commands,
            shutdown,
            next_sid: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }))
    }
}

/// State shared by the session handle and its driver.
#[derive(Debug)]
struct Shared {
    signals: SessionSignals,
    /// sid -> (subject, delivery sender).
    subscriptions: DashMap<u64, (String, mpsc::UnboundedSender<Delivery>)>,
    /// Largest payload the server accepts; 0 until `INFO` announces it.
    max_payload: AtomicU64,
}

#[derive(Debug)]
enum Command {
    Publish { subject: String, payload: Bytes },
    Subscribe { sid: u64 },
}

/// Handle to one NATS connection.
#[derive(Debug)]
pub struct NatsSession {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<bool>,
    next_sid: AtomicU64,
    closed: AtomicBool,
}

impl Session for NatsSession {
    fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        validate_subject(channel).map_err(|e| TransportError::Encoding {
            channel: channel.to_string(),
            reason: e.to_string(),
        })?;
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .subscriptions
            .insert(sid, (channel.to_string(), tx));
        self.commands
            .send(Command::Subscribe { sid })
            .map_err(|_| TransportError::Closed)?;
        Ok(Subscription::new(channel, rx))
    }

    fn publish(&self, channel: &str, message: Value) {
        let encoded = validate_subject(channel)
            .map_err(|e| e.to_string())
            .and_then(|()| serde_json::to_vec(&message).map_err(|e| e.to_string()));
        let payload = match encoded {
            Ok(bytes) => Bytes::from(bytes),
            Err(reason) => {
                self.shared.signals.report(TransportError::Encoding {
                    channel: channel.to_string(),
                    reason,
                });
                return;
            }
        };
        let limit = self.shared.max_payload.load(Ordering::Relaxed);
        let size = u64::try_from(payload.len()).unwrap_or(u64::MAX);
        if limit > 0 && size > limit {
            self.shared.signals.report(TransportError::Encoding {
                channel: channel.to_string(),
                reason: format!("payload of {size} bytes exceeds the broker limit of {limit} bytes"),
            });
            return;
        }
        let command = Command::Publish {
            subject: channel.to_string(),
            payload,
        };
        if self.closed.load(Ordering::SeqCst) || self.commands.send(command).is_err() {
            self.shared.signals.report(TransportError::Closed);
        }
    }

    fn state(&self) -> watch::Receiver<SessionState> {
        self.shared.signals.state()
    }

    fn errors(&self) -> broadcast::Receiver<TransportError> {
        self.shared.signals.errors()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the senders ends every subscription stream.
        self.shared.subscriptions.clear();
        let _ = self.shutdown.send(true);
        self.shared.signals.set_state(SessionState::Closed);
    }
}

/// Why a connection stopped serving.
enum Exit {
    /// Local close; do not reconnect.
    Closed,
    /// Handshake failed; counts as a failed attempt.
    Rejected(TransportError),
    /// Connection lost; reconnect if attempts remain.
    Lost(TransportError),
}

/// Background task owning the TCP connection.
struct Driver {
    address: String,
    options: ConnectOptions,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let signals = &shared.signals;
        let mut failed_attempts: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match TcpStream::connect(&self.address).await {
                Ok(stream) => {
                    let framed = Framed::new(stream, NatsCodec::new());
                    match self.serve(framed).await {
                        Exit::Closed => break,
                        Exit::Rejected(err) => {
                            failed_attempts += 1;
                            signals.report(err);
                        }
                        Exit::Lost(err) => {
                            failed_attempts = 0;
                            warn!(address = %self.address, error = %err, "connection lost");
                            signals.report(err);
                        }
                    }
                }
                Err(e) => {
                    failed_attempts += 1;
                    signals.report(TransportError::Io(format!(
                        "connect to {}: {e}",
                        self.address
                    )));
                }
            }

            if failed_attempts > self.options.max_reconnect_attempts {
                signals.report(TransportError::ReconnectExhausted {
                    attempts: self.options.max_reconnect_attempts,
                });
                break;
            }
            signals.set_state(SessionState::Reconnecting);

            tokio::select! {
                () = tokio::time::sleep(self.options.reconnect_delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        shared.subscriptions.clear();
        signals.set_state(SessionState::Closed);
        debug!(address = %self.address, "driver stopped");
    }

    /// Reads `INFO`, sends `CONNECT`, replays subscriptions and a `PING`, then
    /// waits for the matching `PONG`. A `-ERR` or EOF before that rejects the
    /// connection.
    async fn handshake(
        &self,
        framed: &mut Framed<TcpStream, NatsCodec>,
        sent: &mut HashSet<u64>,
    ) -> Result<(), TransportError> {
        let info = match framed.next().await {
            Some(Ok(ServerOp::Info(info))) => info,
            Some(Ok(other)) => {
                return Err(TransportError::Protocol(format!(
                    "expected INFO, got {other:?}"
                )))
            }
            Some(Err(e)) => return Err(TransportError::Protocol(e.to_string())),
            None => return Err(TransportError::Disconnected("closed during handshake".into())),
        };
        debug!(
            server_id = %info.server_id,
            version = %info.version,
            max_payload = info.max_payload,
            "received server info"
        );
        if info.max_payload > 0 {
            self.shared
                .max_payload
                .store(info.max_payload, Ordering::Relaxed);
            framed
                .codec_mut()
                .set_max_payload(usize::try_from(info.max_payload).unwrap_or(usize::MAX));
        }

        framed
            .feed(ClientOp::Connect(ConnectInfo::new(self.options.name.clone())))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let subs: Vec<(u64, String)> = self
            .shared
            .subscriptions
            .iter()
            .map(|entry| (*entry.key(), entry.value().0.clone()))
            .collect();
        for (sid, subject) in subs {
            framed
                .feed(ClientOp::Sub { subject, sid })
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            sent.insert(sid);
        }
        framed
            .send(ClientOp::Ping)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        loop {
            match framed.next().await {
                Some(Ok(ServerOp::Pong)) => return Ok(()),
                Some(Ok(ServerOp::Err(message))) => return Err(TransportError::Server(message)),
                Some(Ok(op)) => self.on_server_op(op, framed).await?,
                Some(Err(e)) => return Err(TransportError::Protocol(e.to_string())),
                None => {
                    return Err(TransportError::Disconnected(
                        "closed during handshake".into(),
                    ))
                }
            }
        }
    }

    async fn serve(&mut self, mut framed: Framed<TcpStream, NatsCodec>) -> Exit {
        let mut sent = HashSet::new();
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake(&mut framed, &mut sent)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Exit::Rejected(err),
            Err(_) => {
                return Exit::Rejected(TransportError::Protocol(
                    "no PONG to the handshake PING".to_string(),
                ))
            }
        }
        self.shared.signals.set_state(SessionState::Connected);
        info!(address = %self.address, "connected");

        loop {
            tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(op)) => {
                        if let Err(err) = self.on_server_op(op, &mut framed).await {
                            return Exit::Lost(err);
                        }
                    }
                    Some(Err(e)) => return Exit::Lost(TransportError::Protocol(e.to_string())),
                    None => {
                        return Exit::Lost(TransportError::Disconnected(
                            "closed by server".to_string(),
                        ))
                    }
                },
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Exit::Closed;
                    };
                    let op = match command {
                        Command::Publish { subject, payload } => ClientOp::Pub { subject, payload },
                        Command::Subscribe { sid } => {
                            // Already sent during the handshake, or closed meanwhile.
                            if !sent.insert(sid) {
                                continue;
                            }
                            let Some(subject) = self.shared.subscriptions.get(&sid).map(|e| e.0.clone()) else {
                                continue;
                            };
                            ClientOp::Sub { subject, sid }
                        }
                    };
                    if let Err(e) = framed.send(op).await {
                        return Exit::Lost(TransportError::Io(e.to_string()));
                    }
                }
                _ = self.shutdown.changed() => {
                    let _ = framed.close().await;
                    return Exit::Closed;
                }
            }
        }
    }

    async fn on_server_op(
        &self,
        op: ServerOp,
        framed: &mut Framed<TcpStream, NatsCodec>,
    ) -> Result<(), TransportError> {
        match op {
            ServerOp::Msg {
                subject,
                sid,
                payload,
                ..
            } => self.route(subject, sid, &payload, framed).await,
            ServerOp::Ping => framed
                .send(ClientOp::Pong)
                .await
                .map_err(|e| TransportError::Io(e.to_string())),
            ServerOp::Err(message) => {
                self.shared.signals.report(TransportError::Server(message));
                Ok(())
            }
            ServerOp::Info(_) | ServerOp::Pong | ServerOp::Ok => Ok(()),
        }
    }

    async fn route(
        &self,
        subject: String,
        sid: u64,
        payload: &[u8],
        framed: &mut Framed<TcpStream, NatsCodec>,
    ) -> Result<(), TransportError> {
        let body = match serde_json::from_slice::<Value>(payload) {
            Ok(body) => body,
            Err(e) => {
                self.shared.signals.report(TransportError::Encoding {
                    channel: subject,
                    reason: e.to_string(),
                });
                return Ok(());
            }
        };
        let delivered = self.shared.subscriptions.get(&sid).map(|entry| {
            entry
                .value()
                .1
                .send(Delivery {
                    channel: subject,
                    payload: body,
                })
                .is_ok()
        });
        if delivered == Some(false) {
            // Receiver dropped: stop the broker from sending more.
            self.shared.subscriptions.remove(&sid);
            framed
                .send(ClientOp::Unsub { sid })
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
        }
        Ok(())
    }
}
