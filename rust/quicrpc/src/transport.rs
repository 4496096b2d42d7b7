//! Transport seam: what the runtime needs from a QUIC-like connection.
//!
//! A [`Connection`] opens and accepts bidirectional streams. Each stream is a
//! pair of halves: [`SendHalf`] (ordered bytes, half-close, reset with an
//! application code) and [`RecvHalf`] (ordered bytes until FIN, stop-sending
//! with an application code). Errors carry the peer's application code so the
//! caller can map aborts back onto the error taxonomy.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, TryLockError};

/// Failure of a stream or connection operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Peer reset its send side with this application code.
    Reset(u64),
    /// Peer asked us to stop sending with this application code.
    Stopped(u64),
    /// The whole connection is gone. `code` is set for application closes.
    ConnectionLost { code: Option<u64>, reason: String },
    /// The peer finished the stream after only this many of the expected bytes.
    FinishedEarly(usize),
    /// A payload exceeded the configured limit.
    PayloadTooLarge { limit: usize },
    /// The local half was already finished or reset.
    Closed,
}

impl StreamError {
    /// The application error code carried by this error, if any.
    pub fn application_code(&self) -> Option<u64> {
        match self {
            StreamError::Reset(code) | StreamError::Stopped(code) => Some(*code),
            StreamError::ConnectionLost { code, .. } => *code,
            _ => None,
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Reset(code) => write!(f, "stream reset by peer (code {code})"),
            StreamError::Stopped(code) => write!(f, "stream stopped by peer (code {code})"),
            StreamError::ConnectionLost {
                code: Some(code),
                reason,
            } => write!(f, "connection closed by application (code {code}): {reason}"),
            StreamError::ConnectionLost { code: None, reason } => {
                write!(f, "connection lost: {reason}")
            }
            StreamError::FinishedEarly(read) => {
                write!(f, "stream finished early after {read} bytes")
            }
            StreamError::PayloadTooLarge { limit } => {
                write!(f, "payload exceeds limit of {limit} bytes")
            }
            StreamError::Closed => write!(f, "stream already closed"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Sending half of a bidirectional stream.
pub trait SendHalf: Send + 'static {
    /// Write all of `buf`, in order.
    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = Result<(), StreamError>> + Send + 'a;

    /// Half-close: no more bytes will be sent.
    fn finish(&mut self) -> Result<(), StreamError>;

    /// Abandon the send side, signalling `code` to the peer.
    fn reset(&mut self, code: u64);
}

/// Receiving half of a bidirectional stream.
pub trait RecvHalf: Send + 'static {
    /// Read some bytes. `Ok(None)` means the peer finished the stream.
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = Result<Option<usize>, StreamError>> + Send + 'a;

    /// Ask the peer to stop sending, signalling `code`.
    fn stop(&mut self, code: u64);
}

/// A connection that multiplexes bidirectional streams.
pub trait Connection: Send + Sync + 'static {
    type Send: SendHalf;
    type Recv: RecvHalf;

    /// Open a new outbound bidirectional stream.
    fn open_bi(
        &self,
    ) -> impl Future<Output = Result<(Self::Send, Self::Recv), StreamError>> + Send + '_;

    /// Wait for the peer to open a bidirectional stream.
    ///
    /// Fails once the connection is closed.
    fn accept_bi(
        &self,
    ) -> impl Future<Output = Result<(Self::Send, Self::Recv), StreamError>> + Send + '_;
}

impl<C: Connection> Connection for Arc<C> {
    type Send = C::Send;
    type Recv = C::Recv;

    fn open_bi(
        &self,
    ) -> impl Future<Output = Result<(Self::Send, Self::Recv), StreamError>> + Send + '_ {
        (**self).open_bi()
    }

    fn accept_bi(
        &self,
    ) -> impl Future<Output = Result<(Self::Send, Self::Recv), StreamError>> + Send + '_ {
        (**self).accept_bi()
    }
}

/// Both halves of one bidirectional stream.
pub struct BiStream<C: Connection> {
    send: C::Send,
    recv: C::Recv,
}

impl<C: Connection> BiStream<C> {
    pub fn new(send: C::Send, recv: C::Recv) -> Self {
        BiStream { send, recv }
    }

    /// Open a fresh stream on `connection`.
    pub async fn open(connection: &C) -> Result<Self, StreamError> {
        let (send, recv) = connection.open_bi().await?;
        Ok(BiStream::new(send, recv))
    }

    pub fn into_parts(self) -> (C::Send, C::Recv) {
        (self.send, self.recv)
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), StreamError> {
        self.send.write_all(buf).await
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, StreamError> {
        self.recv.read(buf).await
    }

    /// Fill `buf` completely.
    ///
    /// Fails with [`StreamError::FinishedEarly`] if the peer finishes first.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.recv.read(&mut buf[filled..]).await? {
                Some(n) if n > 0 => filled += n,
                _ => return Err(StreamError::FinishedEarly(filled)),
            }
        }
        Ok(())
    }

    /// Read until the peer finishes its side, refusing more than `limit` bytes.
    pub async fn read_to_end(&mut self, limit: usize) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        while let Some(n) = self.recv.read(&mut chunk).await? {
            if out.len() + n > limit {
                return Err(StreamError::PayloadTooLarge { limit });
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }

    /// Half-close the send side.
    pub fn finish(&mut self) -> Result<(), StreamError> {
        self.send.finish()
    }

    /// Abort both directions with `code`.
    pub fn abort(&mut self, code: u64) {
        self.send.reset(code);
        self.recv.stop(code);
    }
}

/// A stream shared between the runtime and user code for the length of a call.
///
/// Streaming handlers and response-only handlers see the stream through this
/// handle while the runtime keeps the ability to answer or abort it. The
/// underlying stream is dropped when the last handle goes away.
pub struct StreamHandle<C: Connection> {
    inner: Arc<Mutex<BiStream<C>>>,
}

impl<C: Connection> StreamHandle<C> {
    pub fn new(stream: BiStream<C>) -> Self {
        StreamHandle {
            inner: Arc::new(Mutex::new(stream)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, BiStream<C>> {
        self.inner.lock().await
    }

    pub fn try_lock(&self) -> Result<MutexGuard<'_, BiStream<C>>, TryLockError> {
        self.inner.try_lock()
    }
}

impl<C: Connection> Clone for StreamHandle<C> {
    fn clone(&self) -> Self {
        StreamHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}
