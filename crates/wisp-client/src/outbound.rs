//! Outbound command buffer and pong wait queue
//!
//! Commands are enqueued as tagged chunks and coalesced into a single write
//! on flush. Chunk boundaries are whole protocol commands, so coalescing
//! never splits a command mid-CRLF. While disconnected the buffer keeps
//! accumulating; on redial it is rebuilt, keeping only publishes and pings
//! that a caller is actually waiting on.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

/// Flush synchronously once this many bytes are pending
pub(crate) const FLUSH_THRESHOLD: usize = 65536;

/// What a pending chunk is, known at enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkKind {
    Connect,
    Pub,
    Sub,
    Unsub,
    Ping,
    Pong,
}

#[derive(Debug)]
pub(crate) struct Chunk {
    pub kind: ChunkKind,
    pub bytes: Bytes,
}

/// One entry per sent PING, popped in order as PONGs arrive
pub(crate) enum PongSlot {
    /// Liveness ping; nothing waits on it
    Bare,
    /// A flush caller waits on this pong
    Flush(oneshot::Sender<()>),
    /// Handshake ping; its pong completes the connect sequence
    Handshake,
}

impl PongSlot {
    pub fn has_waiter(&self) -> bool {
        !matches!(self, PongSlot::Bare)
    }
}

/// The pending send buffer
pub(crate) struct Outbound {
    chunks: Vec<Chunk>,
    size: usize,
    pub flush_scheduled: bool,
}

impl Outbound {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            size: 0,
            flush_scheduled: false,
        }
    }

    pub fn push(&mut self, kind: ChunkKind, bytes: Bytes) {
        self.size += bytes.len();
        self.chunks.push(Chunk { kind, bytes });
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }

    /// Take everything, leaving the buffer empty
    pub fn take_all(&mut self) -> Vec<Chunk> {
        self.size = 0;
        std::mem::take(&mut self.chunks)
    }

    /// Concatenate chunks into one write, preserving order and boundaries
    pub fn coalesce(chunks: &[Chunk]) -> Bytes {
        if chunks.len() == 1 {
            return chunks[0].bytes.clone();
        }
        let total: usize = chunks.iter().map(|c| c.bytes.len()).sum();
        let mut buf = BytesMut::with_capacity(total);
        for chunk in chunks {
            buf.extend_from_slice(&chunk.bytes);
        }
        buf.freeze()
    }

    /// Drop SUB commands queued before the handshake; the registry replay
    /// re-emits them from truth. Other orderings are preserved.
    pub fn strip_subs(&mut self) {
        self.chunks.retain(|c| c.kind != ChunkKind::Sub);
        self.size = self.chunks.iter().map(|c| c.bytes.len()).sum();
    }

    /// Rebuild for a new dial attempt.
    ///
    /// Keeps PUB chunks, and PING chunks whose pong-queue slot has a real
    /// waiter. Everything else is dropped: CONNECT and SUB/UNSUB are re-sent
    /// from truth by the handshake, and a bare PING has nobody waiting.
    ///
    /// The pong queue is rebuilt to exactly the kept slots. Slots for pings
    /// that already reached the old socket are dropped; their waiters learn
    /// of the loss when the sender side is dropped here.
    pub fn rebuild_for_redial(&mut self, pongs: &mut VecDeque<PongSlot>) {
        let old_chunks = self.take_all();
        let pending_pings = old_chunks
            .iter()
            .filter(|c| c.kind == ChunkKind::Ping)
            .count();

        // Pending (unwritten) pings correspond to the queue tail, in order.
        let written = pongs.len().saturating_sub(pending_pings);
        let mut tail: VecDeque<PongSlot> = pongs.split_off(written);
        pongs.clear(); // drops slots for pings already on the dead socket

        let mut kept_slots = VecDeque::new();
        for chunk in old_chunks {
            match chunk.kind {
                ChunkKind::Pub => self.push(chunk.kind, chunk.bytes),
                ChunkKind::Ping => {
                    if let Some(slot) = tail.pop_front() {
                        if slot.has_waiter() {
                            kept_slots.push_back(slot);
                            self.push(chunk.kind, chunk.bytes);
                        }
                    }
                }
                _ => {}
            }
        }
        *pongs = kept_slots;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(kind: ChunkKind, data: &'static [u8]) -> (ChunkKind, Bytes) {
        (kind, Bytes::from_static(data))
    }

    #[test]
    fn test_size_tracks_chunks() {
        let mut out = Outbound::new();
        out.push(ChunkKind::Pub, Bytes::from_static(b"PUB a 1\r\nx\r\n"));
        out.push(ChunkKind::Ping, Bytes::from_static(b"PING\r\n"));
        assert_eq!(out.size(), 12 + 6);

        let taken = out.take_all();
        assert_eq!(taken.len(), 2);
        assert_eq!(out.size(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_coalesce_preserves_order() {
        let mut out = Outbound::new();
        for (kind, data) in [
            chunk(ChunkKind::Pub, b"PUB a 1\r\nx\r\n"),
            chunk(ChunkKind::Pub, b"PUB b 1\r\ny\r\n"),
            chunk(ChunkKind::Ping, b"PING\r\n"),
        ] {
            out.push(kind, data);
        }
        let buf = Outbound::coalesce(&out.take_all());
        assert_eq!(buf.as_ref(), b"PUB a 1\r\nx\r\nPUB b 1\r\ny\r\nPING\r\n");
    }

    #[test]
    fn test_strip_subs() {
        let mut out = Outbound::new();
        out.push(ChunkKind::Pub, Bytes::from_static(b"PUB a 1\r\nx\r\n"));
        out.push(ChunkKind::Sub, Bytes::from_static(b"SUB s 1\r\n"));
        out.push(ChunkKind::Unsub, Bytes::from_static(b"UNSUB 1\r\n"));
        out.strip_subs();
        assert_eq!(out.len(), 2);
        assert_eq!(out.size(), 12 + 9);
    }

    #[test]
    fn test_rebuild_keeps_pubs_drops_control() {
        let mut out = Outbound::new();
        out.push(ChunkKind::Connect, Bytes::from_static(b"CONNECT {}\r\n"));
        out.push(ChunkKind::Pub, Bytes::from_static(b"PUB a 1\r\nx\r\n"));
        out.push(ChunkKind::Sub, Bytes::from_static(b"SUB s 1\r\n"));
        out.push(ChunkKind::Unsub, Bytes::from_static(b"UNSUB 1\r\n"));
        out.push(ChunkKind::Pub, Bytes::from_static(b"PUB b 1\r\ny\r\n"));

        let mut pongs = VecDeque::new();
        out.rebuild_for_redial(&mut pongs);

        let chunks = out.take_all();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.kind == ChunkKind::Pub));
        assert_eq!(chunks[0].bytes.as_ref(), b"PUB a 1\r\nx\r\n");
        assert_eq!(chunks[1].bytes.as_ref(), b"PUB b 1\r\ny\r\n");
    }

    #[test]
    fn test_rebuild_keeps_only_awaited_pings() {
        let mut out = Outbound::new();
        out.push(ChunkKind::Ping, Bytes::from_static(b"PING\r\n"));
        out.push(ChunkKind::Ping, Bytes::from_static(b"PING\r\n"));

        // One ping already on the wire (front slot), two pending: a bare
        // liveness ping and a flush ping.
        let (written_tx, mut written_rx) = oneshot::channel::<()>();
        let (pending_tx, mut pending_rx) = oneshot::channel::<()>();
        let mut pongs = VecDeque::from([
            PongSlot::Flush(written_tx),
            PongSlot::Bare,
            PongSlot::Flush(pending_tx),
        ]);

        out.rebuild_for_redial(&mut pongs);

        let chunks = out.take_all();
        assert_eq!(chunks.len(), 1, "only the awaited pending ping survives");
        assert_eq!(pongs.len(), 1);
        assert!(pongs[0].has_waiter());
        // the written ping's waiter lost its sender; the kept one still waits
        assert!(matches!(
            written_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
        assert!(matches!(
            pending_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn test_flush_threshold_constant() {
        assert_eq!(FLUSH_THRESHOLD, 65536);
    }
}
