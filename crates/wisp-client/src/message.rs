//! Delivered message types

use std::sync::Arc;

use bytes::Bytes;

use crate::options::PayloadMode;

/// Payload of a delivered message, shaped by the configured encoding
#[derive(Debug, Clone)]
pub enum Payload {
    /// Raw bytes (`PayloadMode::Binary`)
    Bytes(Bytes),
    /// UTF-8 text, lossily decoded (`PayloadMode::Text`)
    Text(String),
    /// Decoded JSON value (`PayloadMode::Json`)
    Json(serde_json::Value),
    /// JSON mode was on and the payload failed to parse; the error is
    /// delivered in place of the value
    JsonError(Arc<serde_json::Error>),
}

impl Payload {
    pub(crate) fn decode(mode: PayloadMode, bytes: Bytes) -> Self {
        match mode {
            PayloadMode::Binary => Payload::Bytes(bytes),
            PayloadMode::Text => Payload::Text(String::from_utf8_lossy(&bytes).into_owned()),
            PayloadMode::Json => match serde_json::from_slice(&bytes) {
                Ok(value) => Payload::Json(value),
                Err(e) => Payload::JsonError(Arc::new(e)),
            },
        }
    }

    /// Text view of the payload, when it has one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            Payload::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Raw bytes, for binary payloads
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            Payload::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// A message delivered to a subscription or request callback
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub sid: i64,
    /// Reply subject for request/reply flows
    pub reply: Option<String>,
    pub data: Payload,
}
