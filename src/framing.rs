//! Newline-delimited JSON framing for the engine protocol.
//!
//! Every message on the wire is exactly one UTF-8 line terminated by `\n`.
//! Requests go out as compact JSON objects, responses come back the same way.
//!
//! # Wire Format
//!
//! ```text
//! {"action":"get_stats","params":{"fields":["Life"]}}\n
//! {"ok":true,"stats":{"Life":4120}}\n
//! ```
//!
//! The engine runs inside an interpreter that may print log output on the
//! same stream, so the reading side has to tell protocol lines from noise.
//! [`decode`] classifies a line; [`LineBuffer`] reassembles lines from
//! arbitrarily split chunks.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Maximum length of a single line (64MB). A longer line means the peer is
/// not speaking the protocol, and buffering it would only grow memory.
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Outbound request: `{action, params?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(action: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            action: action.into(),
            params,
        }
    }
}

/// Inbound response: `{ok: true, ...fields}` or `{ok: false, error}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Response {
    pub ok: bool,
    /// Engine error message. A non-string `error` is kept as its JSON text.
    #[serde(default, deserialize_with = "error_text")]
    pub error: Option<String>,
    /// Action-specific result fields (`stats`, `tree`, `items`, ...).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Response {
    /// Interpret a decoded JSON value as a response.
    ///
    /// Fails if the value is not an object with a boolean `ok`.
    pub fn from_value(value: Value) -> Result<Self, String> {
        if !value.get("ok").is_some_and(Value::is_boolean) {
            return Err(format!(
                "expected a response object with boolean `ok`, got {}",
                preview(&value.to_string())
            ));
        }
        serde_json::from_value(value).map_err(|e| format!("invalid response shape: {}", e))
    }
}

fn error_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(message) => Some(message),
        other => Some(other.to_string()),
    })
}

/// Classification of a single inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Empty, or does not start with `{`: interpreter chatter, not protocol.
    Noise,
    /// Starts with `{` but is not valid JSON.
    Malformed(String),
    /// A parsed JSON value.
    Message(Value),
}

/// Encode a request as a single wire line, including the trailing `\n`.
///
/// `serde_json` escapes control characters inside strings, so the output
/// never contains an embedded newline.
pub fn encode(request: &Request) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    Ok(line)
}

/// Classify one line (without its terminator).
pub fn decode(line: &str) -> Decoded {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return Decoded::Noise;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Decoded::Message(value),
        Err(e) => Decoded::Malformed(e.to_string()),
    }
}

/// Shorten a line for log output.
pub fn preview(line: &str) -> String {
    const LIMIT: usize = 200;
    if line.len() <= LIMIT {
        return line.to_string();
    }
    let mut end = LIMIT;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes)", &line[..end], line.len())
}

/// Consumed prefix size above which `LineBuffer` compacts its storage.
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Growing byte buffer that yields complete lines.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere; bytes after the
/// last `\n` are kept until the rest of the line arrives. Every byte is
/// searched for a terminator at most once, so a long line arriving in many
/// small chunks costs time linear in its length.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Start of the unconsumed data.
    start: usize,
    /// Bytes in `start..scanned` are known to contain no `\n`.
    scanned: usize,
    /// Length of the unterminated tail after the last `\n`.
    tail_len: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the transport.
    ///
    /// Returns `false` if the unterminated tail would exceed [`MAX_LINE_BYTES`].
    pub fn extend(&mut self, chunk: &[u8]) -> bool {
        self.tail_len = match chunk.iter().rposition(|b| *b == b'\n') {
            Some(pos) => chunk.len() - pos - 1,
            None => self.tail_len + chunk.len(),
        };
        self.buf.extend_from_slice(chunk);
        self.tail_len <= MAX_LINE_BYTES
    }

    /// Pop the next complete line, without its `\n` (or `\r\n`).
    pub fn next_line(&mut self) -> Option<String> {
        let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') else {
            self.scanned = self.buf.len();
            return None;
        };
        let end = self.scanned + offset;

        let mut line = &self.buf[self.start..end];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        let line = String::from_utf8_lossy(line).into_owned();

        self.start = end + 1;
        self.scanned = self.start;
        self.compact();
        Some(line)
    }

    fn compact(&mut self) {
        if self.start == self.buf.len() {
            self.buf.clear();
        } else if self.start >= COMPACT_THRESHOLD && self.start * 2 >= self.buf.len() {
            self.buf.drain(..self.start);
        } else {
            return;
        }
        self.scanned -= self.start;
        self.start = 0;
    }

    /// Number of buffered bytes, complete lines and partial tail together.
    pub fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything buffered. Returns the number of bytes discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.len();
        *self = Self::default();
        discarded
    }
}
