//! Transport error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("tls handshake failed: {0}")]
    TlsFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
