//! Established socket and its io loop
//!
//! [`Socket`] unifies plain and TLS streams so the handshake code can read
//! INFO before deciding whether to upgrade. [`start_io`] then hands the
//! socket to a background task and returns channel-backed sender/receiver
//! handles; dropping both handles detaches and tears down the task.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{Result, TransportError};
use crate::traits::{TransportEvent, TransportReceiver, TransportSender};

/// Event channel depth for inbound data
const EVENT_CHANNEL_SIZE: usize = 1024;

/// An established connection, plain or TLS
pub enum Socket {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Socket {
    pub fn is_tls(&self) -> bool {
        matches!(self, Socket::Tls(_))
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_flush(cx),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Channel-backed write handle for an established socket
pub struct SocketSender {
    tx: mpsc::UnboundedSender<Bytes>,
    connected: Arc<AtomicBool>,
}

impl TransportSender for SocketSender {
    fn send(&self, data: Bytes) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.tx
            .send(data)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Channel-backed read handle for an established socket
pub struct SocketReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for SocketReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// Hand an established socket to a background io loop.
///
/// The returned sender queues outbound bytes; the receiver yields inbound
/// data and the eventual disconnect. Dropping the receiver ends the loop.
pub fn start_io(socket: Socket) -> (SocketSender, SocketReceiver) {
    let connected = Arc::new(AtomicBool::new(true));
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Bytes>();
    let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(EVENT_CHANNEL_SIZE);

    let sender = SocketSender {
        tx: out_tx,
        connected: connected.clone(),
    };
    let receiver = SocketReceiver { rx: in_rx };

    tokio::spawn(run_io_loop(socket, out_rx, in_tx, connected));

    (sender, receiver)
}

async fn run_io_loop(
    socket: Socket,
    mut out_rx: mpsc::UnboundedReceiver<Bytes>,
    in_tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
) {
    let (mut reader, mut writer) = tokio::io::split(socket);
    let mut read_buf = BytesMut::with_capacity(8 * 1024);

    loop {
        tokio::select! {
            maybe = out_rx.recv() => {
                match maybe {
                    Some(data) => {
                        if let Err(e) = writer.write_all(&data).await {
                            error!("socket write error: {}", e);
                            let _ = in_tx
                                .send(TransportEvent::Disconnected { reason: Some(e.to_string()) })
                                .await;
                            break;
                        }
                    }
                    None => {
                        // All senders dropped: clean local shutdown.
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }

            result = reader.read_buf(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        debug!("socket closed by peer");
                        let _ = in_tx.send(TransportEvent::Disconnected { reason: None }).await;
                        break;
                    }
                    Ok(_) => {
                        let data = read_buf.split().freeze();
                        if in_tx.send(TransportEvent::Data(data)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("socket read error: {}", e);
                        let _ = in_tx.send(TransportEvent::Error(e.to_string())).await;
                        let _ = in_tx
                            .send(TransportEvent::Disconnected { reason: Some(e.to_string()) })
                            .await;
                        break;
                    }
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
}
