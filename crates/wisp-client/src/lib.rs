//! wisp Client Library
//!
//! Async client for the wisp messaging bus: publish/subscribe over a
//! single long-lived connection, request/reply over a shared mux inbox,
//! and transparent reconnection through a rotating server list.
//!
//! # Example
//!
//! ```ignore
//! use wisp_client::Client;
//!
//! #[tokio::main]
//! async fn main() -> wisp_client::Result<()> {
//!     let client = Client::connect("nats://localhost:4222").await?;
//!
//!     client.subscribe("events.>", |msg| {
//!         println!("{}: {:?}", msg.subject, msg.data);
//!     })?;
//!
//!     client.publish("events.started", "hello")?;
//!     client.flush().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
mod conn;
pub mod error;
pub mod events;
pub mod message;
mod mux;
pub mod options;
pub mod servers;
mod outbound;
mod subs;

pub use auth::{Creds, NonceSigner};
pub use client::{Client, RequestOptions, Stats, Status};
pub use error::{Error, Result};
pub use events::{ClientEvents, NullEvents};
pub use message::{Message, Payload};
pub use options::{ClientBuilder, JwtSource, Options, PayloadMode, TlsMode};
pub use servers::{ServerAddr, UrlAuth};
pub use subs::SubOptions;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::client::{Client, RequestOptions, Stats, Status};
    pub use crate::error::{Error, Result};
    pub use crate::events::ClientEvents;
    pub use crate::message::{Message, Payload};
    pub use crate::options::{ClientBuilder, PayloadMode};
    pub use crate::subs::SubOptions;
}
