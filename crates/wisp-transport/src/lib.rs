//! wisp transport
//!
//! Socket plumbing for the wisp client: TCP dialing with keepalive, the
//! in-place TLS upgrade performed after the server's first INFO, and the
//! background io loop that turns an established socket into a pair of
//! channel-backed sender/receiver handles.

pub mod error;
pub mod socket;
pub mod tcp;
pub mod tls;
pub mod traits;

pub use error::{Result, TransportError};
pub use socket::{start_io, Socket, SocketReceiver, SocketSender};
pub use tcp::{dial, TcpConfig};
pub use tls::{upgrade, CertVerification, ClientCert, TlsConfig};
pub use traits::{TransportEvent, TransportReceiver, TransportSender};
