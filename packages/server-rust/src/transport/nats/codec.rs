//! NATS text protocol framing.
//!
//! Decodes server operations (`INFO`, `MSG`, `PING`, `PONG`, `+OK`, `-ERR`)
//! and encodes client operations (`CONNECT`, `PUB`, `SUB`, `UNSUB`, `PING`,
//! `PONG`). Control lines end in CRLF; `MSG` and `PUB` are followed by a
//! payload of the announced size plus a trailing CRLF.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";

/// Default upper bound for a single control line.
pub const DEFAULT_MAX_LINE: usize = 4096;

/// Upper bound for a `MSG` payload until the server announces its own.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Fields of the server `INFO` greeting the client cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub server_id: String,
    pub version: String,
    pub max_payload: u64,
}

/// Options announced by the client in `CONNECT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    pub lang: String,
    pub version: String,
    pub protocol: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ConnectInfo {
    /// Quiet, non-pedantic options for this client.
    #[must_use]
    pub fn new(name: Option<String>) -> Self {
        Self {
            verbose: false,
            pedantic: false,
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: 1,
            name,
        }
    }
}

/// Operation sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOp {
    Info(ServerInfo),
    Msg {
        subject: String,
        sid: u64,
        reply_to: Option<String>,
        payload: Bytes,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Operation sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOp {
    Connect(ConnectInfo),
    Pub { subject: String, payload: Bytes },
    Sub { subject: String, sid: u64 },
    Unsub { sid: u64 },
    Ping,
    Pong,
}

/// Framing errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("control line exceeds {max} bytes")]
    LineTooLong { max: usize },
    #[error("malformed {op} line: {line:?}")]
    Malformed { op: &'static str, line: String },
    #[error("unknown operation: {0:?}")]
    UnknownOp(String),
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
    #[error("cannot encode CONNECT options: {0}")]
    Json(#[from] serde_json::Error),
}

/// Header of a `MSG` whose payload has not fully arrived yet.
#[derive(Debug)]
struct PendingMsg {
    subject: String,
    sid: u64,
    reply_to: Option<String>,
    len: usize,
}

/// `tokio_util` codec for the NATS client side.
#[derive(Debug)]
pub struct NatsCodec {
    pending: Option<PendingMsg>,
    max_line: usize,
    max_payload: usize,
}

impl NatsCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE)
    }

    #[must_use]
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            pending: None,
            max_line,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Rejects `MSG` frames announcing more than `max` payload bytes.
    pub fn set_max_payload(&mut self, max: usize) {
        self.max_payload = max;
    }

    fn parse_line(&mut self, line: &str) -> Result<Option<ServerOp>, CodecError> {
        let (op, rest) = line
            .split_once(' ')
            .map_or((line, ""), |(op, rest)| (op, rest.trim()));

        match op.to_ascii_uppercase().as_str() {
            "MSG" => {
                let msg = parse_msg_header(line, rest)?;
                if msg.len > self.max_payload {
                    return Err(CodecError::Malformed {
                        op: "MSG",
                        line: format!("{line} (payload exceeds {} bytes)", self.max_payload),
                    });
                }
                self.pending = Some(msg);
                Ok(None)
            }
            "PING" => Ok(Some(ServerOp::Ping)),
            "PONG" => Ok(Some(ServerOp::Pong)),
            "+OK" => Ok(Some(ServerOp::Ok)),
            "-ERR" => Ok(Some(ServerOp::Err(rest.trim_matches('\'').to_string()))),
            "INFO" => serde_json::from_str(rest)
                .map(|info| Some(ServerOp::Info(info)))
                .map_err(|_| CodecError::Malformed {
                    op: "INFO",
                    line: line.to_string(),
                }),
            _ => Err(CodecError::UnknownOp(line.to_string())),
        }
    }
}

impl Default for NatsCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks that `subject` can be written into a control line: non-empty, with
/// no whitespace or control characters.
///
/// # Errors
///
/// Returns `CodecError::InvalidSubject` otherwise.
pub fn validate_subject(subject: &str) -> Result<(), CodecError> {
    if subject.is_empty() || subject.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CodecError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

fn parse_msg_header(line: &str, args: &str) -> Result<PendingMsg, CodecError> {
    let malformed = || CodecError::Malformed {
        op: "MSG",
        line: line.to_string(),
    };
    let parts: Vec<&str> = args.split_whitespace().collect();
    let (subject, sid, reply_to, len) = match parts.as_slice() {
        [subject, sid, len] => (*subject, *sid, None, *len),
        [subject, sid, reply, len] => (*subject, *sid, Some((*reply).to_string()), *len),
        _ => return Err(malformed()),
    };
    Ok(PendingMsg {
        subject: subject.to_string(),
        sid: sid.parse().map_err(|_| malformed())?,
        reply_to,
        len: len.parse().map_err(|_| malformed())?,
    })
}

impl Decoder for NatsCodec {
    type Item = ServerOp;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerOp>, CodecError> {
        loop {
            if let Some(msg) = self.pending.take() {
                let needed = msg.len + CRLF.len();
                if src.len() < needed {
                    src.reserve(needed - src.len());
                    self.pending = Some(msg);
                    return Ok(None);
                }
                let payload = src.split_to(msg.len).freeze();
                if &src[..CRLF.len()] != CRLF {
                    return Err(CodecError::Malformed {
                        op: "MSG",
                        line: format!("payload for {} not terminated by CRLF", msg.subject),
                    });
                }
                src.advance(CRLF.len());
                return Ok(Some(ServerOp::Msg {
                    subject: msg.subject,
                    sid: msg.sid,
                    reply_to: msg.reply_to,
                    payload,
                }));
            }

            let Some(end) = src.windows(CRLF.len()).position(|w| w == CRLF) else {
                if src.len() > self.max_line {
                    return Err(CodecError::LineTooLong { max: self.max_line });
                }
                return Ok(None);
            };
            if end > self.max_line {
                return Err(CodecError::LineTooLong { max: self.max_line });
            }

            let line = src.split_to(end);
            src.advance(CRLF.len());
            let line = String::from_utf8_lossy(&line).into_owned();

            // A MSG header only arms `pending`; loop to read its payload.
            if let Some(op) = self.parse_line(&line)? {
                return Ok(Some(op));
            }
        }
    }
}

impl Encoder<ClientOp> for NatsCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ClientOp, dst: &mut BytesMut) -> Result<(), CodecError> {
        match item {
            ClientOp::Connect(options) => {
                let options = serde_json::to_vec(&options)?;
                dst.put_slice(b"CONNECT ");
                dst.put_slice(&options);
                dst.put_slice(CRLF);
            }
            ClientOp::Pub { subject, payload } => {
                validate_subject(&subject)?;
                dst.reserve(subject.len() + payload.len() + 32);
                dst.put_slice(format!("PUB {subject} {}", payload.len()).as_bytes());
                dst.put_slice(CRLF);
                dst.put_slice(&payload);
                dst.put_slice(CRLF);
            }
            ClientOp::Sub { subject, sid } => {
                validate_subject(&subject)?;
                dst.put_slice(format!("SUB {subject} {sid}").as_bytes());
                dst.put_slice(CRLF);
            }
            ClientOp::Unsub { sid } => {
                dst.put_slice(format!("UNSUB {sid}").as_bytes());
                dst.put_slice(CRLF);
            }
            ClientOp::Ping => dst.put_slice(b"PING\r\n"),
            ClientOp::Pong => dst.put_slice(b"PONG\r\n"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<ServerOp> {
        let mut codec = NatsCodec::new();
        let mut buf = BytesMut::from(input);
        let mut ops = Vec::new();
        while let Some(op) = codec.decode(&mut buf).unwrap() {
            ops.push(op);
        }
        ops
    }

    fn encode(op: ClientOp) -> String {
        let mut codec = NatsCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(op, &mut buf).unwrap();
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn decodes_control_ops() {
        let ops = decode_all(b"PING\r\nPONG\r\n+OK\r\n-ERR 'Unknown Protocol Operation'\r\n");
        assert_eq!(
            ops,
            vec![
                ServerOp::Ping,
                ServerOp::Pong,
                ServerOp::Ok,
                ServerOp::Err("Unknown Protocol Operation".to_string()),
            ]
        );
    }

    #[test]
    fn decodes_info() {
        let ops = decode_all(b"INFO {\"server_id\":\"abc\",\"max_payload\":1048576}\r\n");
        assert_eq!(
            ops,
            vec![ServerOp::Info(ServerInfo {
                server_id: "abc".to_string(),
                version: String::new(),
                max_payload: 1_048_576,
            })]
        );
    }

    #[test]
    fn decodes_msg_with_and_without_reply() {
        let ops = decode_all(b"MSG greet_ack 1 5\r\nhello\r\nMSG a 2 inbox.1 2\r\nhi\r\n");
        assert_eq!(
            ops,
            vec![
                ServerOp::Msg {
                    subject: "greet_ack".to_string(),
                    sid: 1,
                    reply_to: None,
                    payload: Bytes::from_static(b"hello"),
                },
                ServerOp::Msg {
                    subject: "a".to_string(),
                    sid: 2,
                    reply_to: Some("inbox.1".to_string()),
                    payload: Bytes::from_static(b"hi"),
                },
            ]
        );
    }

    #[test]
    fn msg_payload_may_contain_crlf() {
        let ops = decode_all(b"MSG s 1 4\r\na\r\nb\r\n");
        assert_eq!(
            ops,
            vec![ServerOp::Msg {
                subject: "s".to_string(),
                sid: 1,
                reply_to: None,
                payload: Bytes::from_static(b"a\r\nb"),
            }]
        );
    }

    #[test]
    fn waits_for_split_payload() {
        let mut codec = NatsCodec::new();
        let mut buf = BytesMut::from(&b"MSG s 7 3\r\nab"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"c\r\n");
        let op = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            op,
            ServerOp::Msg {
                subject: "s".to_string(),
                sid: 7,
                reply_to: None,
                payload: Bytes::from_static(b"abc"),
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_partial_line() {
        let mut codec = NatsCodec::new();
        let mut buf = BytesMut::from(&b"PI"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"NG\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ServerOp::Ping));
    }

    #[test]
    fn rejects_malformed_msg() {
        let mut codec = NatsCodec::new();
        let mut buf = BytesMut::from(&b"MSG s notanumber 3\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Malformed { op: "MSG", .. })
        ));
    }

    #[test]
    fn rejects_msg_larger_than_max_payload() {
        let mut codec = NatsCodec::new();
        codec.set_max_payload(16);
        let mut buf = BytesMut::from(&b"MSG greet_ack 1 17\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Malformed { op: "MSG", .. })
        ));

        let mut codec = NatsCodec::new();
        let mut buf = BytesMut::from(&b"MSG greet_ack 1 18446744073709551615\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Malformed { op: "MSG", .. })
        ));
    }

    #[test]
    fn subjects_with_whitespace_or_control_chars_are_not_encoded() {
        for subject in ["greet_x 2_res", "greet_x\r\nPUB admin 2_res", "a\tb", ""] {
            let mut codec = NatsCodec::new();
            let mut dst = BytesMut::new();
            let err = codec
                .encode(
                    ClientOp::Pub {
                        subject: subject.to_string(),
                        payload: Bytes::from_static(b"{}"),
                    },
                    &mut dst,
                )
                .unwrap_err();
            assert!(matches!(err, CodecError::InvalidSubject(_)));
            assert!(dst.is_empty());

            let err = codec
                .encode(
                    ClientOp::Sub {
                        subject: subject.to_string(),
                        sid: 1,
                    },
                    &mut dst,
                )
                .unwrap_err();
            assert!(matches!(err, CodecError::InvalidSubject(_)));
            assert!(dst.is_empty());
        }
        assert!(validate_subject("greet_42_res").is_ok());
    }

    #[test]
    fn rejects_unknown_op() {
        let mut codec = NatsCodec::new();
        let mut buf = BytesMut::from(&b"BOGUS\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::UnknownOp(_))
        ));
    }

    #[test]
    fn rejects_overlong_line() {
        let mut codec = NatsCodec::with_max_line(8);
        let mut buf = BytesMut::from(&b"INFO {\"aaaaaaaaaaaa\":1}"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::LineTooLong { max: 8 })
        ));
    }

    #[test]
    fn encodes_client_ops() {
        assert_eq!(
            encode(ClientOp::Pub {
                subject: "greet_42_res".to_string(),
                payload: Bytes::from_static(b"{\"id\":\"42\"}"),
            }),
            "PUB greet_42_res 11\r\n{\"id\":\"42\"}\r\n"
        );
        assert_eq!(
            encode(ClientOp::Sub {
                subject: "greet_ack".to_string(),
                sid: 3,
            }),
            "SUB greet_ack 3\r\n"
        );
        assert_eq!(encode(ClientOp::Unsub { sid: 3 }), "UNSUB 3\r\n");
        assert_eq!(encode(ClientOp::Ping), "PING\r\n");
        assert_eq!(encode(ClientOp::Pong), "PONG\r\n");
        assert_eq!(
            encode(ClientOp::Connect(ConnectInfo {
                verbose: false,
                pedantic: false,
                lang: "rust".to_string(),
                version: "1.0.0".to_string(),
                protocol: 1,
                name: Some("svc-consumer".to_string()),
            })),
            "CONNECT {\"verbose\":false,\"pedantic\":false,\"lang\":\"rust\",\"version\":\"1.0.0\",\"protocol\":1,\"name\":\"svc-consumer\"}\r\n"
        );
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn msg_decoding_survives_arbitrary_chunking(
                payload in proptest::collection::vec(any::<u8>(), 0..256),
                split in 0usize..512,
            ) {
                let mut frame = format!("MSG greet_ack 7 {}\r\n", payload.len()).into_bytes();
                frame.extend_from_slice(&payload);
                frame.extend_from_slice(b"\r\nPING\r\n");
                let split = split.min(frame.len());

                let mut codec = NatsCodec::new();
                let mut buf = BytesMut::from(&frame[..split]);
                let mut ops = Vec::new();
                while let Some(op) = codec.decode(&mut buf).unwrap() {
                    ops.push(op);
                }
                buf.extend_from_slice(&frame[split..]);
                while let Some(op) = codec.decode(&mut buf).unwrap() {
                    ops.push(op);
                }

                prop_assert_eq!(
                    ops,
                    vec![
                        ServerOp::Msg {
                            subject: "greet_ack".to_string(),
                            sid: 7,
                            reply_to: None,
                            payload: Bytes::from(payload),
                        },
                        ServerOp::Ping,
                    ]
                );
                prop_assert!(buf.is_empty());
            }
        }
    }
}
