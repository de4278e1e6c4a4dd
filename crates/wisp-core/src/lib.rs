//! wisp core
//!
//! Core types and protocol primitives for the wisp messaging bus.
//!
//! This crate provides:
//! - The incremental wire parser ([`Parser`], [`ServerOp`])
//! - Protocol message types ([`ServerInfo`], [`ConnectInfo`]) and the
//!   client-side command encoders ([`proto`])
//! - Subject validation and inbox naming ([`subject`])
//! - Unique id generation for inboxes and request tokens ([`nuid`])

pub mod error;
pub mod nuid;
pub mod parser;
pub mod proto;
pub mod subject;

pub use error::{Error, Result};
pub use parser::{Parser, ServerOp, MAX_CONTROL_LINE_SIZE};
pub use proto::{ConnectInfo, ServerInfo};
pub use subject::{is_valid_subject, new_inbox, INBOX_PREFIX};

/// Protocol version the client announces in CONNECT.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default server port when the URL omits one.
pub const DEFAULT_PORT: u16 = 4222;

/// Language tag announced in CONNECT.
pub const LANG: &str = "rust";

/// Client library version announced in CONNECT.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
