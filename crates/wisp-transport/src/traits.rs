//! Transport trait definitions

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Events surfaced by an established transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Raw bytes received
    Data(Bytes),
    /// Connection closed (clean or error)
    Disconnected { reason: Option<String> },
    /// Error occurred
    Error(String),
}

/// Trait for writing to an established transport
pub trait TransportSender: Send + Sync {
    /// Queue bytes for the socket; fails once the connection is gone
    fn send(&self, data: Bytes) -> Result<()>;

    /// Check if the underlying socket is still up
    fn is_connected(&self) -> bool;

    /// Tear the connection down
    fn close(&self);
}

/// Trait for reading events from an established transport
#[async_trait]
pub trait TransportReceiver: Send {
    /// Receive the next event; `None` once the io loop has exited
    async fn recv(&mut self) -> Option<TransportEvent>;
}
