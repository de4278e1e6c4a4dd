//! Typed event surface
//!
//! A client takes one observer implementing [`ClientEvents`]; every method
//! has a no-op default, so implementations only override what they watch.
//! Callbacks run on the client's connection task and must not block.

use crate::error::Error;

/// Observer for connection lifecycle and subscription events
#[allow(unused_variables)]
pub trait ClientEvents: Send + Sync {
    /// First successful handshake completed
    fn on_connect(&self) {}

    /// Handshake completed on a later connection
    fn on_reconnect(&self) {}

    /// A reconnect cycle is starting
    fn on_reconnecting(&self) {}

    /// The socket dropped; the client may still reconnect
    fn on_disconnect(&self) {}

    /// The client gave up and will make no further attempts
    fn on_close(&self) {}

    /// An asynchronous error surfaced
    fn on_error(&self, err: &Error) {}

    /// The server rejected an operation for lack of permissions;
    /// the connection stays up
    fn on_permission_error(&self, err: &Error) {}

    fn on_subscribe(&self, sid: i64, subject: &str, queue_group: Option<&str>) {}

    fn on_unsubscribe(&self, sid: i64, subject: &str) {}

    /// The server list changed after gossip
    fn on_servers(&self, added: &[String]) {}

    /// New servers were discovered via gossip
    fn on_servers_discovered(&self, added: &[String]) {}

    /// The liveness timer fired
    fn on_ping_timer(&self) {}

    /// A PING was sent; reports the outstanding count
    fn on_ping_count(&self, outstanding: u32) {}
}

/// Observer that ignores every event
pub struct NullEvents;

impl ClientEvents for NullEvents {}
