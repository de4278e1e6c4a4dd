//! Incremental wire parser
//!
//! A push parser over an unbounded byte stream. Bytes are appended with
//! [`Parser::feed`]; complete operations are drained with [`Parser::next`].
//! Two states: scanning for a control line, or accumulating a message
//! payload whose size the control line announced.
//!
//! Control lines longer than [`MAX_CONTROL_LINE_SIZE`] without a terminator,
//! and lines that match no known verb, cause the parser to yield and wait
//! for more input rather than fail.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::proto::ServerInfo;

/// Longest prefix of the buffer inspected for a control line
pub const MAX_CONTROL_LINE_SIZE: usize = 1024;

/// A complete operation received from the server
#[derive(Debug)]
pub enum ServerOp {
    Info(ServerInfo),
    Msg {
        subject: String,
        sid: i64,
        reply: Option<String>,
        payload: Bytes,
    },
    Ok,
    Err(String),
    Ping,
    Pong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingControl,
    AwaitingPayload,
}

#[derive(Debug)]
struct PendingMsg {
    subject: String,
    sid: i64,
    reply: Option<String>,
    size: usize,
}

/// Incremental parser state
#[derive(Debug)]
pub struct Parser {
    buf: BytesMut,
    state: State,
    pending: Option<PendingMsg>,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            state: State::AwaitingControl,
            pending: None,
        }
    }

    /// Append raw socket bytes
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered and not yet consumed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drain the next complete operation, or `None` when more input is needed
    pub fn next(&mut self) -> Result<Option<ServerOp>> {
        match self.state {
            State::AwaitingControl => self.next_control(),
            State::AwaitingPayload => self.next_payload(),
        }
    }

    fn next_control(&mut self) -> Result<Option<ServerOp>> {
        let Some(line_len) = find_crlf(&self.buf, MAX_CONTROL_LINE_SIZE) else {
            return Ok(None);
        };

        // Borrow the line only long enough to classify it.
        let op = {
            let line = &self.buf[..line_len];
            if line == b"+OK" {
                Some(ServerOp::Ok)
            } else if line == b"PING" {
                Some(ServerOp::Ping)
            } else if line == b"PONG" {
                Some(ServerOp::Pong)
            } else if let Some(rest) = line.strip_prefix(b"MSG ") {
                let args = parse_msg_args(rest)?;
                self.pending = Some(args);
                None
            } else if let Some(json) = line.strip_prefix(b"INFO ") {
                let info: ServerInfo = serde_json::from_slice(json)
                    .map_err(|e| Error::BadInfoJson(e.to_string()))?;
                Some(ServerOp::Info(info))
            } else if let Some(text) = line.strip_prefix(b"-ERR") {
                let text = String::from_utf8_lossy(text)
                    .trim()
                    .trim_matches('\'')
                    .to_string();
                Some(ServerOp::Err(text))
            } else {
                // Unrecognised control bytes are not an error: yield and wait
                // for more input without consuming.
                return Ok(None);
            }
        };

        self.buf.advance(line_len + 2);
        if self.pending.is_some() {
            self.state = State::AwaitingPayload;
            return self.next_payload();
        }
        Ok(op)
    }

    fn next_payload(&mut self) -> Result<Option<ServerOp>> {
        let size = self
            .pending
            .as_ref()
            .map(|m| m.size)
            .expect("payload state without pending message");

        // Payload plus the trailing CRLF, which is discarded.
        if self.buf.len() < size + 2 {
            return Ok(None);
        }

        let payload = self.buf.split_to(size).freeze();
        self.buf.advance(2);
        self.state = State::AwaitingControl;

        let msg = self.pending.take().expect("pending message");
        Ok(Some(ServerOp::Msg {
            subject: msg.subject,
            sid: msg.sid,
            reply: msg.reply,
            payload,
        }))
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// Find a CRLF whose start lies within the first `limit` bytes.
/// Returns the line length (bytes before the CR).
fn find_crlf(buf: &[u8], limit: usize) -> Option<usize> {
    let window = buf.len().min(limit + 1);
    buf[..window]
        .windows(2)
        .position(|w| w == b"\r\n")
        .filter(|&pos| pos < limit)
}

/// Parse `<subject> <sid> [reply] <size>` after the `MSG ` prefix.
fn parse_msg_args(rest: &[u8]) -> Result<PendingMsg> {
    let text = std::str::from_utf8(rest)
        .map_err(|_| Error::MalformedControl("MSG header is not valid utf-8".into()))?;
    let fields: Vec<&str> = text.split_whitespace().collect();

    let (subject, sid_str, reply, size_str) = match fields.as_slice() {
        [subject, sid, size] => (*subject, *sid, None, *size),
        [subject, sid, reply, size] => (*subject, *sid, Some(reply.to_string()), *size),
        _ => return Err(Error::MalformedControl(format!("MSG {text}"))),
    };

    let sid: i64 = sid_str
        .parse()
        .map_err(|_| Error::MalformedControl(format!("MSG sid: {sid_str}")))?;
    let size: usize = size_str
        .parse()
        .map_err(|_| Error::MalformedControl(format!("MSG size: {size_str}")))?;

    Ok(PendingMsg {
        subject: subject.to_string(),
        sid,
        reply,
        size,
    })
}
