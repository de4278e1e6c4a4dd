//! Client error types
//!
//! Every variant carries a stable code (see [`Error::code`]) so callers can
//! match on error identity without string comparison.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // Configuration / caller misuse
    #[error("invalid client options: {0}")]
    BadOptions(String),

    #[error("subject is not valid")]
    BadSubject,

    #[error("message cannot be sent: {0}")]
    BadMsg(String),

    #[error("reply subject is not valid")]
    BadReply,

    #[error("payload is not valid json: {0}")]
    BadJson(String),

    #[error("user and token are mutually exclusive")]
    BadAuthentication,

    #[error("invalid payload encoding: {0}")]
    InvalidEncoding(String),

    // Connectivity / protocol
    #[error("could not connect to server: {0}")]
    Conn(String),

    #[error("connection closed")]
    ConnClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("stale connection")]
    StaleConnection,

    #[error("server returned an error: {0}")]
    Server(String),

    // Security negotiation
    #[error("server requires a secure connection")]
    SecureConnRequired,

    #[error("server does not support secure connections")]
    NonSecureConnRequired,

    #[error("server requires a client certificate")]
    ClientCertRequired,

    // Key / credentials
    #[error("server requires a nonce signature and no signer is configured")]
    SignatureRequired,

    #[error("an nkey or user jwt must be configured")]
    NkeyOrJwtRequired,

    #[error("credentials are not valid: {0}")]
    BadCredentials(String),

    #[error("no seed found in credentials")]
    NoSeedInCreds,

    #[error("no user jwt found in credentials")]
    NoUserJwtInCreds,

    // Request / delivery
    #[error("request timed out")]
    RequestTimeout,

    #[error("delivery callback panicked: {0}")]
    Callback(String),

    #[error(transparent)]
    Core(#[from] wisp_core::Error),

    #[error(transparent)]
    Transport(#[from] wisp_transport::TransportError),
}

impl Error {
    /// Stable error code, independent of the display message.
    pub fn code(&self) -> &'static str {
        match self {
            Error::BadOptions(_) => "BAD_OPTIONS",
            Error::BadSubject => "BAD_SUBJECT",
            Error::BadMsg(_) => "BAD_MSG",
            Error::BadReply => "BAD_REPLY",
            Error::BadJson(_) => "BAD_JSON",
            Error::BadAuthentication => "BAD_AUTHENTICATION",
            Error::InvalidEncoding(_) => "INVALID_ENCODING",
            Error::Conn(_) => "CONN_ERR",
            Error::ConnClosed => "CONN_CLOSED",
            Error::Protocol(_) => "NATS_PROTOCOL_ERR",
            Error::StaleConnection => "STALE_CONNECTION",
            Error::Server(_) => "NATS_PROTOCOL_ERR",
            Error::SecureConnRequired => "SECURE_CONN_REQ",
            Error::NonSecureConnRequired => "NON_SECURE_CONN_REQ",
            Error::ClientCertRequired => "CLIENT_CERT_REQ",
            Error::SignatureRequired => "SIG_REQ",
            Error::NkeyOrJwtRequired => "NKEY_OR_JWT_REQ",
            Error::BadCredentials(_) => "BAD_CREDENTIALS",
            Error::NoSeedInCreds => "NO_SEED_IN_CREDS",
            Error::NoUserJwtInCreds => "NO_USER_JWT_IN_CREDS",
            Error::RequestTimeout => "REQ_TIMEOUT",
            Error::Callback(_) => "CALLBACK_ERR",
            Error::Core(_) => "NATS_PROTOCOL_ERR",
            Error::Transport(_) => "CONN_ERR",
        }
    }
}
