//! In-process [`Connection`] backed by tokio channels.
//!
//! Mirrors the parts of QUIC stream semantics the runtime relies on: ordered
//! bytes, half-close, reset and stop-sending with application codes, and
//! connection close failing every later stream operation. No IO, no framing.

use std::sync::{Arc, OnceLock};

use bytes::{Buf, Bytes};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::transport::{Connection, RecvHalf, SendHalf, StreamError};

enum Chunk {
    Data(Bytes),
    Fin,
    Reset(u64),
}

struct Shared {
    closed: CancellationToken,
    reason: OnceLock<(u64, String)>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn lost(&self) -> StreamError {
        match self.reason.get() {
            Some((code, reason)) => StreamError::ConnectionLost {
                code: Some(*code),
                reason: reason.clone(),
            },
            None => StreamError::ConnectionLost {
                code: None,
                reason: "connection closed".into(),
            },
        }
    }
}

type StreamPair = (MemorySendStream, MemoryRecvStream);

/// One end of an in-process connection.
pub struct MemoryConnection {
    peer: mpsc::UnboundedSender<StreamPair>,
    incoming: Mutex<mpsc::UnboundedReceiver<StreamPair>>,
    shared: Arc<Shared>,
}

/// Create a pair of connected [`MemoryConnection`]s.
///
/// Streams opened on `a` are accepted on `b` and vice versa.
pub fn memory_connection_pair() -> (MemoryConnection, MemoryConnection) {
    let (to_b, from_a) = mpsc::unbounded_channel();
    let (to_a, from_b) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        closed: CancellationToken::new(),
        reason: OnceLock::new(),
    });

    let a = MemoryConnection {
        peer: to_b,
        incoming: Mutex::new(from_b),
        shared: Arc::clone(&shared),
    };
    let b = MemoryConnection {
        peer: to_a,
        incoming: Mutex::new(from_a),
        shared,
    };
    (a, b)
}

impl MemoryConnection {
    /// Close the connection for both ends with an application code.
    ///
    /// Pending and future stream operations fail with
    /// [`StreamError::ConnectionLost`] carrying `code`.
    pub fn close(&self, code: u64, reason: &str) {
        let _ = self.shared.reason.set((code, reason.to_owned()));
        self.shared.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    fn stream_pair(&self) -> (StreamPair, StreamPair) {
        let (local_tx, peer_rx) = mpsc::unbounded_channel();
        let (peer_tx, local_rx) = mpsc::unbounded_channel();
        let (local_stop_tx, local_stop_rx) = watch::channel(None);
        let (peer_stop_tx, peer_stop_rx) = watch::channel(None);

        let local = (
            MemorySendStream::new(local_tx, local_stop_rx, Arc::clone(&self.shared)),
            MemoryRecvStream::new(local_rx, peer_stop_tx, Arc::clone(&self.shared)),
        );
        let peer = (
            MemorySendStream::new(peer_tx, peer_stop_rx, Arc::clone(&self.shared)),
            MemoryRecvStream::new(peer_rx, local_stop_tx, Arc::clone(&self.shared)),
        );
        (local, peer)
    }
}

impl Connection for MemoryConnection {
    type Send = MemorySendStream;
    type Recv = MemoryRecvStream;

    async fn open_bi(&self) -> Result<StreamPair, StreamError> {
        if self.shared.is_closed() {
            return Err(self.shared.lost());
        }
        let (local, peer) = self.stream_pair();
        self.peer
            .send(peer)
            .map_err(|_| StreamError::ConnectionLost {
                code: None,
                reason: "peer connection dropped".into(),
            })?;
        Ok(local)
    }

    async fn accept_bi(&self) -> Result<StreamPair, StreamError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => Err(self.shared.lost()),
            pair = incoming.recv() => pair.ok_or_else(|| StreamError::ConnectionLost {
                code: None,
                reason: "peer connection dropped".into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Send
// ---------------------------------------------------------------------------

/// Sending half of an in-process stream. Dropping it finishes the stream.
pub struct MemorySendStream {
    tx: mpsc::UnboundedSender<Chunk>,
    stopped: watch::Receiver<Option<u64>>,
    shared: Arc<Shared>,
    done: bool,
}

impl MemorySendStream {
    fn new(
        tx: mpsc::UnboundedSender<Chunk>,
        stopped: watch::Receiver<Option<u64>>,
        shared: Arc<Shared>,
    ) -> Self {
        MemorySendStream {
            tx,
            stopped,
            shared,
            done: false,
        }
    }
}

impl SendHalf for MemorySendStream {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), StreamError> {
        if self.shared.is_closed() {
            return Err(self.shared.lost());
        }
        if self.done {
            return Err(StreamError::Closed);
        }
        if let Some(code) = *self.stopped.borrow() {
            return Err(StreamError::Stopped(code));
        }
        if buf.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Chunk::Data(Bytes::copy_from_slice(buf)))
            .map_err(|_| StreamError::Stopped(0))
    }

    fn finish(&mut self) -> Result<(), StreamError> {
        if self.done {
            return Err(StreamError::Closed);
        }
        self.done = true;
        let _ = self.tx.send(Chunk::Fin);
        Ok(())
    }

    fn reset(&mut self, code: u64) {
        if self.done {
            return;
        }
        self.done = true;
        let _ = self.tx.send(Chunk::Reset(code));
    }
}

impl Drop for MemorySendStream {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.tx.send(Chunk::Fin);
        }
    }
}

// ---------------------------------------------------------------------------
// Recv
// ---------------------------------------------------------------------------

/// Receiving half of an in-process stream.
///
/// Dropping it before the peer finished stops the peer with code 0.
pub struct MemoryRecvStream {
    rx: mpsc::UnboundedReceiver<Chunk>,
    stop: watch::Sender<Option<u64>>,
    shared: Arc<Shared>,
    pending: Bytes,
    eof: bool,
    stopped: bool,
}

impl MemoryRecvStream {
    fn new(
        rx: mpsc::UnboundedReceiver<Chunk>,
        stop: watch::Sender<Option<u64>>,
        shared: Arc<Shared>,
    ) -> Self {
        MemoryRecvStream {
            rx,
            stop,
            shared,
            pending: Bytes::new(),
            eof: false,
            stopped: false,
        }
    }

    fn take_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        n
    }
}

impl RecvHalf for MemoryRecvStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, StreamError> {
        if self.shared.is_closed() {
            return Err(self.shared.lost());
        }
        if self.stopped {
            return Err(StreamError::Closed);
        }
        if buf.is_empty() {
            return Ok(Some(0));
        }
        if !self.pending.is_empty() {
            return Ok(Some(self.take_pending(buf)));
        }
        if self.eof {
            return Ok(None);
        }

        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.shared.closed.cancelled() => return Err(self.shared.lost()),
                chunk = self.rx.recv() => chunk,
            };
            match chunk {
                Some(Chunk::Data(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    self.pending = data;
                    return Ok(Some(self.take_pending(buf)));
                }
                Some(Chunk::Fin) => {
                    self.eof = true;
                    return Ok(None);
                }
                Some(Chunk::Reset(code)) => {
                    self.eof = true;
                    return Err(StreamError::Reset(code));
                }
                None => {
                    self.eof = true;
                    return Err(StreamError::ConnectionLost {
                        code: None,
                        reason: "stream dropped without finishing".into(),
                    });
                }
            }
        }
    }

    fn stop(&mut self, code: u64) {
        if self.stopped || self.eof {
            return;
        }
        self.stopped = true;
        self.stop.send_replace(Some(code));
        self.rx.close();
    }
}

impl Drop for MemoryRecvStream {
    fn drop(&mut self) {
        self.stop(0);
    }
}
