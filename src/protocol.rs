//! Wire protocol operations: framing of client operations and an
//! incremental parser for server operations.
//!
//! The parser is restartable: it consumes whatever bytes are available in the
//! read buffer and yields fully decoded operations one at a time, carrying
//! partial-operation state between calls so a message split across reads is
//! reassembled transparently.

use crate::error::{ClientError, Result};
use crate::message::HeaderMap;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Maximum accepted length of a single control line
const MAX_CONTROL_LINE: usize = 4096;

const CRLF: &[u8] = b"\r\n";

/// Server INFO payload received at session establishment and asynchronously
/// whenever the broker's peer list changes
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    /// Unique server identifier
    #[serde(default)]
    pub server_id: String,
    /// Server software version
    #[serde(default)]
    pub version: String,
    /// Advertised host
    #[serde(default)]
    pub host: String,
    /// Advertised port
    #[serde(default)]
    pub port: u16,
    /// Maximum accepted payload size in bytes (0 means unlimited)
    #[serde(default)]
    pub max_payload: usize,
    /// Protocol version supported by the server
    #[serde(default)]
    pub proto: i32,
    /// Whether the server supports message headers
    #[serde(default)]
    pub headers: bool,
    /// Whether the server requires authentication
    #[serde(default)]
    pub auth_required: bool,
    /// Whether the server requires TLS
    #[serde(default)]
    pub tls_required: bool,
    /// Gossiped peer endpoints as `host:port` strings
    #[serde(default)]
    pub connect_urls: Vec<String>,
}

/// CONNECT payload sent once per transport session establishment
#[derive(Debug, Clone, Serialize)]
pub struct ConnectInfo {
    /// Request +OK acknowledgment for every operation
    pub verbose: bool,
    /// Request strict subject checking on the server
    pub pedantic: bool,
    /// Whether the client requires a TLS connection
    pub tls_required: bool,
    /// Authentication token, when configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Username, when configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password, when configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    /// Optional client name reported to the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Client implementation language
    pub lang: String,
    /// Client library version
    pub version: String,
    /// Maximum protocol version the client understands
    pub protocol: i32,
    /// Whether the server should echo this client's own publishes back
    pub echo: bool,
    /// Whether the client understands message headers
    pub headers: bool,
    /// Whether the client understands no-responders status replies
    pub no_responders: bool,
}

/// A fully decoded operation received from the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOp {
    /// Server information / peer gossip
    Info(Box<ServerInfo>),
    /// An inbound message for a subscription
    Msg {
        /// Subject the message was published to
        subject: String,
        /// Target subscription identifier
        sid: u64,
        /// Optional reply subject
        reply: Option<String>,
        /// Raw header block bytes, when present
        headers: Option<Bytes>,
        /// Message payload
        payload: Bytes,
    },
    /// Keepalive probe from the server
    Ping,
    /// Keepalive acknowledgment from the server
    Pong,
    /// Verbose-mode acknowledgment
    Ok,
    /// Server-reported error
    Err(String),
}

impl PartialEq for ServerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.server_id == other.server_id && self.connect_urls == other.connect_urls
    }
}

/// Pending message arguments carried between parser calls while the payload
/// bytes are still arriving
#[derive(Debug)]
struct PartialMsg {
    subject: String,
    sid: u64,
    reply: Option<String>,
    header_len: usize,
    total_len: usize,
}

#[derive(Debug)]
enum ParseState {
    /// Scanning for a complete control line
    OpLine,
    /// A MSG/HMSG control line was decoded; awaiting payload bytes
    Payload(PartialMsg),
}

/// Incremental decoder for server operations
#[derive(Debug)]
pub(crate) struct Parser {
    state: ParseState,
}

impl Parser {
    pub(crate) fn new() -> Self {
        Self {
            state: ParseState::OpLine,
        }
    }

    /// Decode the next complete operation from `buf`, consuming its bytes.
    ///
    /// Returns `Ok(None)` when more bytes are needed; partial state is kept
    /// for the next call.
    pub(crate) fn next_op(&mut self, buf: &mut BytesMut) -> Result<Option<ServerOp>> {
        loop {
            match &self.state {
                ParseState::OpLine => {
                    let Some(pos) = find_crlf(buf) else {
                        if buf.len() > MAX_CONTROL_LINE {
                            return Err(ClientError::protocol("control line too long"));
                        }
                        return Ok(None);
                    };
                    let line = buf.split_to(pos + 2);
                    let line = std::str::from_utf8(&line[..pos])
                        .map_err(|_| ClientError::protocol("control line is not valid UTF-8"))?;

                    let (verb, args) = match line.split_once(char::is_whitespace) {
                        Some((verb, args)) => (verb, args.trim()),
                        None => (line, ""),
                    };

                    if verb.eq_ignore_ascii_case("PING") {
                        return Ok(Some(ServerOp::Ping));
                    } else if verb.eq_ignore_ascii_case("PONG") {
                        return Ok(Some(ServerOp::Pong));
                    } else if verb == "+OK" {
                        return Ok(Some(ServerOp::Ok));
                    } else if verb == "-ERR" {
                        let text = args.trim_matches('\'').to_string();
                        return Ok(Some(ServerOp::Err(text)));
                    } else if verb.eq_ignore_ascii_case("INFO") {
                        let info: ServerInfo = serde_json::from_str(args).map_err(|e| {
                            ClientError::protocol(format!("invalid INFO payload: {e}"))
                        })?;
                        return Ok(Some(ServerOp::Info(Box::new(info))));
                    } else if verb.eq_ignore_ascii_case("MSG") {
                        self.state = ParseState::Payload(parse_msg_args(args, false)?);
                    } else if verb.eq_ignore_ascii_case("HMSG") {
                        self.state = ParseState::Payload(parse_msg_args(args, true)?);
                    } else {
                        return Err(ClientError::protocol(format!(
                            "unknown protocol operation '{verb}'"
                        )));
                    }
                }
                ParseState::Payload(partial) => {
                    let needed = partial.total_len + 2;
                    if buf.len() < needed {
                        return Ok(None);
                    }
                    let data = buf.split_to(needed);
                    if &data[partial.total_len..] != CRLF {
                        return Err(ClientError::protocol("message payload missing CRLF"));
                    }
                    let data = data.freeze();

                    let ParseState::Payload(partial) =
                        std::mem::replace(&mut self.state, ParseState::OpLine)
                    else {
                        unreachable!()
                    };
                    let headers = if partial.header_len > 0 {
                        Some(data.slice(..partial.header_len))
                    } else {
                        None
                    };
                    let payload = data.slice(partial.header_len..partial.total_len);
                    return Ok(Some(ServerOp::Msg {
                        subject: partial.subject,
                        sid: partial.sid,
                        reply: partial.reply,
                        headers,
                        payload,
                    }));
                }
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Parse `MSG <subject> <sid> [reply] <len>` or
/// `HMSG <subject> <sid> [reply] <hdr-len> <total-len>` arguments
fn parse_msg_args(args: &str, has_headers: bool) -> Result<PartialMsg> {
    let tokens: Vec<&str> = args.split_whitespace().collect();
    let fixed = if has_headers { 4 } else { 3 };
    if tokens.len() < fixed || tokens.len() > fixed + 1 {
        return Err(ClientError::protocol(format!(
            "wrong number of message arguments: {args}"
        )));
    }
    let has_reply = tokens.len() == fixed + 1;

    let subject = tokens[0].to_string();
    let sid = tokens[1]
        .parse::<u64>()
        .map_err(|_| ClientError::protocol(format!("invalid sid: {}", tokens[1])))?;
    let reply = if has_reply {
        Some(tokens[2].to_string())
    } else {
        None
    };

    let parse_len = |s: &str| -> Result<usize> {
        s.parse::<usize>()
            .map_err(|_| ClientError::protocol(format!("invalid message length: {s}")))
    };

    let (header_len, total_len) = if has_headers {
        let header_len = parse_len(tokens[tokens.len() - 2])?;
        let total_len = parse_len(tokens[tokens.len() - 1])?;
        if header_len > total_len {
            return Err(ClientError::protocol(
                "header length exceeds total message length",
            ));
        }
        (header_len, total_len)
    } else {
        (0, parse_len(tokens[tokens.len() - 1])?)
    };

    Ok(PartialMsg {
        subject,
        sid,
        reply,
        header_len,
        total_len,
    })
}

/// Frame a CONNECT operation
pub(crate) fn encode_connect(buf: &mut BytesMut, info: &ConnectInfo) -> Result<()> {
    let body = serde_json::to_vec(info)
        .map_err(|e| ClientError::protocol(format!("failed to encode CONNECT: {e}")))?;
    buf.extend_from_slice(b"CONNECT ");
    buf.extend_from_slice(&body);
    buf.extend_from_slice(CRLF);
    Ok(())
}

/// Frame a PUB or HPUB operation
pub(crate) fn encode_pub(
    buf: &mut BytesMut,
    subject: &str,
    reply: Option<&str>,
    headers: Option<&HeaderMap>,
    payload: &[u8],
) {
    match headers {
        Some(headers) => {
            let header_block = headers.encode();
            buf.extend_from_slice(b"HPUB ");
            buf.extend_from_slice(subject.as_bytes());
            buf.extend_from_slice(b" ");
            if let Some(reply) = reply {
                buf.extend_from_slice(reply.as_bytes());
                buf.extend_from_slice(b" ");
            }
            buf.extend_from_slice(
                format!("{} {}", header_block.len(), header_block.len() + payload.len())
                    .as_bytes(),
            );
            buf.extend_from_slice(CRLF);
            buf.extend_from_slice(&header_block);
        }
        None => {
            buf.extend_from_slice(b"PUB ");
            buf.extend_from_slice(subject.as_bytes());
            buf.extend_from_slice(b" ");
            if let Some(reply) = reply {
                buf.extend_from_slice(reply.as_bytes());
                buf.extend_from_slice(b" ");
            }
            buf.extend_from_slice(format!("{}", payload.len()).as_bytes());
            buf.extend_from_slice(CRLF);
        }
    }
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
}

/// Frame a SUB operation
pub(crate) fn encode_sub(buf: &mut BytesMut, subject: &str, queue_group: Option<&str>, sid: u64) {
    buf.extend_from_slice(b"SUB ");
    buf.extend_from_slice(subject.as_bytes());
    buf.extend_from_slice(b" ");
    if let Some(group) = queue_group {
        buf.extend_from_slice(group.as_bytes());
        buf.extend_from_slice(b" ");
    }
    buf.extend_from_slice(format!("{sid}").as_bytes());
    buf.extend_from_slice(CRLF);
}

/// Frame an UNSUB operation with an optional max-messages qualifier
pub(crate) fn encode_unsub(buf: &mut BytesMut, sid: u64, max_msgs: Option<u64>) {
    match max_msgs {
        Some(max) => buf.extend_from_slice(format!("UNSUB {sid} {max}").as_bytes()),
        None => buf.extend_from_slice(format!("UNSUB {sid}").as_bytes()),
    }
    buf.extend_from_slice(CRLF);
}

/// Frame a PING operation
pub(crate) fn encode_ping(buf: &mut BytesMut) {
    buf.extend_from_slice(b"PING\r\n");
}

/// Frame a PONG operation
pub(crate) fn encode_pong(buf: &mut BytesMut) {
    buf.extend_from_slice(b"PONG\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut Parser, buf: &mut BytesMut, data: &[u8]) -> Vec<ServerOp> {
        buf.extend_from_slice(data);
        let mut ops = Vec::new();
        while let Some(op) = parser.next_op(buf).unwrap() {
            ops.push(op);
        }
        ops
    }

    #[test]
    fn test_parse_simple_ops() {
        let mut parser = Parser::new();
        let mut buf = BytesMut::new();
        let ops = feed(&mut parser, &mut buf, b"PING\r\nPONG\r\n+OK\r\n");
        assert_eq!(ops, vec![ServerOp::Ping, ServerOp::Pong, ServerOp::Ok]);
    }

    #[test]
    fn test_parse_err() {
        let mut parser = Parser::new();
        let mut buf = BytesMut::new();
        let ops = feed(
            &mut parser,
            &mut buf,
            b"-ERR 'Authorization Violation'\r\n",
        );
        assert_eq!(
            ops,
            vec![ServerOp::Err("Authorization Violation".to_string())]
        );
    }

    #[test]
    fn test_parse_info() {
        let mut parser = Parser::new();
        let mut buf = BytesMut::new();
        let ops = feed(
            &mut parser,
            &mut buf,
            b"INFO {\"server_id\":\"abc\",\"max_payload\":1048576,\"headers\":true,\"connect_urls\":[\"10.0.0.2:4222\"]}\r\n",
        );
        assert_eq!(ops.len(), 1);
        let ServerOp::Info(info) = &ops[0] else {
            panic!("expected INFO");
        };
        assert_eq!(info.server_id, "abc");
        assert_eq!(info.max_payload, 1_048_576);
        assert!(info.headers);
        assert_eq!(info.connect_urls, vec!["10.0.0.2:4222".to_string()]);
    }

    #[test]
    fn test_parse_msg() {
        let mut parser = Parser::new();
        let mut buf = BytesMut::new();
        let ops = feed(&mut parser, &mut buf, b"MSG foo.bar 9 5\r\nhello\r\n");
        assert_eq!(ops.len(), 1);
        let ServerOp::Msg {
            subject,
            sid,
            reply,
            headers,
            payload,
        } = &ops[0]
        else {
            panic!("expected MSG");
        };
        assert_eq!(subject, "foo.bar");
        assert_eq!(*sid, 9);
        assert_eq!(*reply, None);
        assert!(headers.is_none());
        assert_eq!(payload.as_ref(), b"hello");
    }

    #[test]
    fn test_parse_msg_with_reply() {
        let mut parser = Parser::new();
        let mut buf = BytesMut::new();
        let ops = feed(&mut parser, &mut buf, b"MSG foo 1 _INBOX.abc 2\r\nok\r\n");
        let ServerOp::Msg { reply, .. } = &ops[0] else {
            panic!("expected MSG");
        };
        assert_eq!(reply.as_deref(), Some("_INBOX.abc"));
    }

    #[test]
    fn test_parse_hmsg() {
        let mut parser = Parser::new();
        let mut buf = BytesMut::new();
        let header_block = b"NATS/1.0\r\nA: 1\r\n\r\n";
        let frame = format!(
            "HMSG foo 3 {} {}\r\n",
            header_block.len(),
            header_block.len() + 5
        );
        buf.extend_from_slice(frame.as_bytes());
        buf.extend_from_slice(header_block);
        buf.extend_from_slice(b"world\r\n");

        let op = parser.next_op(&mut buf).unwrap().unwrap();
        let ServerOp::Msg {
            headers, payload, ..
        } = op
        else {
            panic!("expected HMSG");
        };
        assert_eq!(headers.as_deref(), Some(header_block.as_slice()));
        assert_eq!(payload.as_ref(), b"world");
    }

    #[test]
    fn test_parse_split_across_feeds() {
        let mut parser = Parser::new();
        let mut buf = BytesMut::new();

        assert!(feed(&mut parser, &mut buf, b"MSG foo.bar ").is_empty());
        assert!(feed(&mut parser, &mut buf, b"7 11\r\nhello").is_empty());
        let ops = feed(&mut parser, &mut buf, b" world\r\nPING\r\n");
        assert_eq!(ops.len(), 2);
        let ServerOp::Msg { sid, payload, .. } = &ops[0] else {
            panic!("expected MSG");
        };
        assert_eq!(*sid, 7);
        assert_eq!(payload.as_ref(), b"hello world");
        assert_eq!(ops[1], ServerOp::Ping);
    }

    #[test]
    fn test_parse_unknown_op() {
        let mut parser = Parser::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"BOGUS stuff\r\n");
        assert!(parser.next_op(&mut buf).is_err());
    }

    #[test]
    fn test_parse_missing_payload_crlf() {
        let mut parser = Parser::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"MSG foo 1 5\r\nhelloXX");
        assert!(parser.next_op(&mut buf).is_err());
    }

    #[test]
    fn test_encode_pub() {
        let mut buf = BytesMut::new();
        encode_pub(&mut buf, "foo", None, None, b"hi");
        assert_eq!(&buf[..], b"PUB foo 2\r\nhi\r\n");

        let mut buf = BytesMut::new();
        encode_pub(&mut buf, "foo", Some("bar"), None, b"hi");
        assert_eq!(&buf[..], b"PUB foo bar 2\r\nhi\r\n");
    }

    #[test]
    fn test_encode_hpub_roundtrip() {
        let mut headers = HeaderMap::new();
        headers.insert("K", "v");
        let mut buf = BytesMut::new();
        encode_pub(&mut buf, "foo", None, Some(&headers), b"data");

        // Servers echo HPUB frames back as HMSG with identical framing, so
        // the encoded form must parse as a message with the same contents.
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.starts_with("HPUB foo "));
        let mut parser = Parser::new();
        let mut rx = BytesMut::from(text.replace("HPUB foo ", "HMSG foo 1 ").as_bytes());
        let op = parser.next_op(&mut rx).unwrap().unwrap();
        let ServerOp::Msg {
            headers: raw,
            payload,
            ..
        } = op
        else {
            panic!("expected message");
        };
        let (parsed, _, _) = HeaderMap::parse(&raw.unwrap()).unwrap();
        assert_eq!(parsed.get("K"), Some("v"));
        assert_eq!(payload.as_ref(), b"data");
    }

    #[test]
    fn test_encode_sub_unsub() {
        let mut buf = BytesMut::new();
        encode_sub(&mut buf, "foo.*", Some("workers"), 4);
        assert_eq!(&buf[..], b"SUB foo.* workers 4\r\n");

        let mut buf = BytesMut::new();
        encode_unsub(&mut buf, 4, Some(10));
        assert_eq!(&buf[..], b"UNSUB 4 10\r\n");

        let mut buf = BytesMut::new();
        encode_unsub(&mut buf, 4, None);
        assert_eq!(&buf[..], b"UNSUB 4\r\n");
    }

    #[test]
    fn test_encode_connect() {
        let info = ConnectInfo {
            verbose: false,
            pedantic: false,
            tls_required: false,
            auth_token: None,
            user: Some("u".to_string()),
            pass: Some("p".to_string()),
            name: None,
            lang: "rust".to_string(),
            version: "0.1.0".to_string(),
            protocol: 1,
            echo: true,
            headers: true,
            no_responders: true,
        };
        let mut buf = BytesMut::new();
        encode_connect(&mut buf, &info).unwrap();
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.starts_with("CONNECT {"));
        assert!(text.ends_with("\r\n"));
        assert!(text.contains("\"user\":\"u\""));
        assert!(!text.contains("auth_token"));
    }
}
