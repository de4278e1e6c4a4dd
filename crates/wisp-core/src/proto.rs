//! Protocol message types and client command encoders
//!
//! The wire protocol is line oriented with CRLF terminators:
//!
//! ```text
//! client -> server:  CONNECT <json>  PUB <subj> [reply] <n>\r\n<payload>  SUB  UNSUB  PING  PONG
//! server -> client:  INFO <json>  MSG <subj> <sid> [reply] <n>\r\n<payload>  +OK  -ERR '<text>'  PING  PONG
//! ```
//!
//! Encoders here produce complete commands including the trailing CRLF, so a
//! chunk handed to the send path is always a whole protocol unit.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fields of the server's INFO message the client consumes.
///
/// Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub proto: i32,
    #[serde(default)]
    pub max_payload: u64,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub tls_verify: bool,
    /// Base64 of the bytes to sign when the server demands key authentication
    #[serde(default)]
    pub nonce: Option<String>,
    /// Gossiped peer list, `host:port` entries
    #[serde(default)]
    pub connect_urls: Vec<String>,
}

/// The CONNECT payload the client emits after the first INFO.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectInfo {
    pub lang: String,
    pub version: String,
    pub verbose: bool,
    pub pedantic: bool,
    pub protocol: u8,
    /// Base64 signature over the server nonce
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ConnectInfo {
    /// New CONNECT payload with the constant fields filled in
    pub fn new(verbose: bool, pedantic: bool) -> Self {
        Self {
            lang: crate::LANG.to_string(),
            version: crate::VERSION.to_string(),
            verbose,
            pedantic,
            protocol: crate::PROTOCOL_VERSION,
            sig: None,
            jwt: None,
            nkey: None,
            user: None,
            pass: None,
            auth_token: None,
            name: None,
        }
    }
}

pub const PING_OP: &[u8] = b"PING\r\n";
pub const PONG_OP: &[u8] = b"PONG\r\n";

const CRLF: &[u8] = b"\r\n";

/// Encode `CONNECT <json>\r\n`
pub fn connect_op(info: &ConnectInfo) -> Result<Bytes> {
    let json = serde_json::to_vec(info).map_err(|e| Error::BadConnectJson(e.to_string()))?;
    let mut buf = BytesMut::with_capacity(8 + json.len() + 2);
    buf.put_slice(b"CONNECT ");
    buf.put_slice(&json);
    buf.put_slice(CRLF);
    Ok(buf.freeze())
}

/// Encode `PUB <subject> [reply] <size>\r\n<payload>\r\n`
pub fn pub_op(subject: &str, reply: Option<&str>, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + subject.len() + payload.len());
    buf.put_slice(b"PUB ");
    buf.put_slice(subject.as_bytes());
    if let Some(reply) = reply {
        buf.put_u8(b' ');
        buf.put_slice(reply.as_bytes());
    }
    buf.put_u8(b' ');
    buf.put_slice(payload.len().to_string().as_bytes());
    buf.put_slice(CRLF);
    buf.put_slice(payload);
    buf.put_slice(CRLF);
    buf.freeze()
}

/// Encode `SUB <subject> [queue] <sid>\r\n`
pub fn sub_op(subject: &str, queue_group: Option<&str>, sid: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(12 + subject.len());
    buf.put_slice(b"SUB ");
    buf.put_slice(subject.as_bytes());
    if let Some(group) = queue_group {
        buf.put_u8(b' ');
        buf.put_slice(group.as_bytes());
    }
    buf.put_u8(b' ');
    buf.put_slice(sid.to_string().as_bytes());
    buf.put_slice(CRLF);
    buf.freeze()
}

/// Encode `UNSUB <sid> [max]\r\n`
pub fn unsub_op(sid: i64, max: Option<u64>) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_slice(b"UNSUB ");
    buf.put_slice(sid.to_string().as_bytes());
    if let Some(max) = max {
        buf.put_u8(b' ');
        buf.put_slice(max.to_string().as_bytes());
    }
    buf.put_slice(CRLF);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pub_op() {
        assert_eq!(
            pub_op("foo", None, b"hello").as_ref(),
            b"PUB foo 5\r\nhello\r\n"
        );
        assert_eq!(
            pub_op("foo", Some("bar"), b"").as_ref(),
            b"PUB foo bar 0\r\n\r\n"
        );
    }

    #[test]
    fn test_pub_op_binary_payload() {
        let payload = [0u8, 1, 2, 0xff, b'\r', b'\n'];
        let op = pub_op("bin", None, &payload);
        assert!(op.starts_with(b"PUB bin 6\r\n"));
        assert_eq!(&op[11..17], &payload);
        assert!(op.ends_with(b"\r\n"));
    }

    #[test]
    fn test_sub_op() {
        assert_eq!(sub_op("foo", None, 1).as_ref(), b"SUB foo 1\r\n");
        assert_eq!(sub_op("foo", Some("g1"), 7).as_ref(), b"SUB foo g1 7\r\n");
    }

    #[test]
    fn test_unsub_op() {
        assert_eq!(unsub_op(3, None).as_ref(), b"UNSUB 3\r\n");
        assert_eq!(unsub_op(3, Some(10)).as_ref(), b"UNSUB 3 10\r\n");
    }

    #[test]
    fn test_connect_op_minimal() {
        let info = ConnectInfo::new(false, false);
        let op = connect_op(&info).unwrap();
        let text = std::str::from_utf8(&op).unwrap();
        assert!(text.starts_with("CONNECT {"));
        assert!(text.ends_with("}\r\n"));
        assert!(text.contains("\"protocol\":1"));
        assert!(text.contains("\"lang\":\"rust\""));
        // optional fields absent entirely, not null
        assert!(!text.contains("sig"));
        assert!(!text.contains("jwt"));
    }

    #[test]
    fn test_connect_op_auth_fields() {
        let mut info = ConnectInfo::new(true, true);
        info.user = Some("alice".into());
        info.pass = Some("s3cret".into());
        info.name = Some("wisp test".into());
        let op = connect_op(&info).unwrap();
        let text = std::str::from_utf8(&op).unwrap();
        assert!(text.contains("\"user\":\"alice\""));
        assert!(text.contains("\"pass\":\"s3cret\""));
        assert!(text.contains("\"name\":\"wisp test\""));
        assert!(text.contains("\"verbose\":true"));
    }

    #[test]
    fn test_server_info_decode() {
        let info: ServerInfo = serde_json::from_str(
            r#"{"server_id":"a1","max_payload":1048576,"tls_required":true,
                "nonce":"abcd","connect_urls":["10.0.0.1:4222"],"unknown_field":42}"#,
        )
        .unwrap();
        assert_eq!(info.server_id, "a1");
        assert_eq!(info.max_payload, 1_048_576);
        assert!(info.tls_required);
        assert_eq!(info.nonce.as_deref(), Some("abcd"));
        assert_eq!(info.connect_urls, vec!["10.0.0.1:4222"]);
    }
}
