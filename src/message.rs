//! Message model and header encoding for the wirebus client

use crate::error::{ClientError, Result};
use bytes::Bytes;

/// Header version prefix sent before the header block of a message
pub(crate) const HEADER_VERSION: &str = "NATS/1.0";

/// Status code a broker attaches to a request reply when no subscription
/// matched the request subject
pub(crate) const STATUS_NO_RESPONDERS: u16 = 503;

/// An ordered multi-map of message headers.
///
/// Header names keep their insertion order and each name can carry multiple
/// values. The wire form is the `NATS/1.0` header block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    /// Create an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value for a header name, creating the name if absent
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        for (existing, values) in &mut self.entries {
            if existing.eq_ignore_ascii_case(&name) {
                values.push(value);
                return;
            }
        }
        self.entries.push((name, vec![value]));
    }

    /// Get the first value for a header name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(String::as_str)
    }

    /// Get all values for a header name (case-insensitive)
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    /// Number of distinct header names
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no headers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over (name, values) pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    /// Encode the header block including version line and terminating blank line
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.entries.len() * 32);
        out.extend_from_slice(HEADER_VERSION.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, values) in &self.entries {
            for value in values {
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Parse a header block, returning the map plus any inline status code
    /// and description carried on the version line
    pub(crate) fn parse(data: &[u8]) -> Result<(Self, Option<u16>, Option<String>)> {
        let text = std::str::from_utf8(data)
            .map_err(|_| ClientError::protocol("header block is not valid UTF-8"))?;
        let mut lines = text.split("\r\n");

        let version_line = lines
            .next()
            .ok_or_else(|| ClientError::protocol("empty header block"))?;
        let rest = version_line
            .strip_prefix(HEADER_VERSION)
            .ok_or_else(|| {
                ClientError::protocol(format!("invalid header version line: {version_line}"))
            })?
            .trim();

        let (status, description) = if rest.is_empty() {
            (None, None)
        } else {
            let (code, desc) = match rest.split_once(char::is_whitespace) {
                Some((code, desc)) => (code, desc.trim()),
                None => (rest, ""),
            };
            let code = code.parse::<u16>().map_err(|_| {
                ClientError::protocol(format!("invalid header status code: {code}"))
            })?;
            let description = if desc.is_empty() {
                None
            } else {
                Some(desc.to_string())
            };
            (Some(code), description)
        };

        let mut map = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ClientError::protocol(format!("malformed header line: {line}")))?;
            map.insert(name.trim(), value.trim());
        }

        Ok((map, status, description))
    }
}

/// A message delivered to a subscriber or published by the application.
///
/// Messages handed to subscribers are immutable from the library's
/// perspective; payloads are shared `Bytes` the user may read freely.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Subject the message was published to
    pub subject: String,
    /// Optional reply subject for request-style messages
    pub reply: Option<String>,
    /// Optional message headers
    pub headers: Option<HeaderMap>,
    /// Message payload
    pub payload: Bytes,
    /// Optional inline status code from the header block
    pub status: Option<u16>,
    /// Optional status description from the header block
    pub description: Option<String>,
}

impl Message {
    /// Create a message for publishing
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: None,
            payload: payload.into(),
            status: None,
            description: None,
        }
    }

    /// Whether this message is a broker no-responders signal
    pub fn is_no_responders(&self) -> bool {
        self.status == Some(STATUS_NO_RESPONDERS)
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
