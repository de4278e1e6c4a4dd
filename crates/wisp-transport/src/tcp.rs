//! TCP dialing
//!
//! Plain TCP with TCP_NODELAY always set (the protocol is latency
//! sensitive and commands are already coalesced client-side) and optional
//! OS-level keepalive.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::info;

use crate::error::{Result, TransportError};

/// TCP configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Keep-alive interval in seconds (0 = disabled)
    pub keepalive_secs: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self { keepalive_secs: 30 }
    }
}

/// Dial a TCP endpoint
pub async fn dial(host: &str, port: u16, config: &TcpConfig) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    stream
        .set_nodelay(true)
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    if config.keepalive_secs > 0 {
        let socket = socket2::SockRef::from(&stream);
        let keepalive =
            socket2::TcpKeepalive::new().with_time(Duration::from_secs(config.keepalive_secs));
        let _ = socket.set_tcp_keepalive(&keepalive);
    }

    info!("tcp connected to {}:{}", host, port);
    Ok(stream)
}
