//! Error types for wisp-core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol-level error types
#[derive(Error, Debug)]
pub enum Error {
    /// A control line matched a known verb but its arguments are malformed
    #[error("malformed control line: {0}")]
    MalformedControl(String),

    /// INFO carried a JSON body the client could not decode
    #[error("invalid INFO json: {0}")]
    BadInfoJson(String),

    /// CONNECT options could not be serialized
    #[error("connect serialization failed: {0}")]
    BadConnectJson(String),

    /// Subject failed validation
    #[error("invalid subject: {0}")]
    InvalidSubject(String),
}
