//! QUIC transport for quicrpc via quinn.
//!
//! [`QuinnConnection`] wraps a `quinn::Connection` and implements
//! [`quicrpc::Connection`], so a [`quicrpc::Service`] can serve it and a
//! [`quicrpc::Client`] can call over it. Application error codes on stream
//! resets, stop-sending and connection close are carried through unchanged.

use quicrpc::{Connection, RecvHalf, SendHalf, StreamError};
use quinn::VarInt;

/// A quinn connection usable as a quicrpc transport.
#[derive(Clone, Debug)]
pub struct QuinnConnection {
    inner: quinn::Connection,
}

impl QuinnConnection {
    pub fn new(inner: quinn::Connection) -> Self {
        QuinnConnection { inner }
    }

    pub fn inner(&self) -> &quinn::Connection {
        &self.inner
    }

    pub fn into_inner(self) -> quinn::Connection {
        self.inner
    }

    /// Close the connection with an application error code.
    pub fn close(&self, code: u64, reason: &str) {
        self.inner.close(varint(code), reason.as_bytes());
    }
}

impl From<quinn::Connection> for QuinnConnection {
    fn from(inner: quinn::Connection) -> Self {
        QuinnConnection::new(inner)
    }
}

impl Connection for QuinnConnection {
    type Send = QuinnSend;
    type Recv = QuinnRecv;

    async fn open_bi(&self) -> Result<(QuinnSend, QuinnRecv), StreamError> {
        let (send, recv) = self.inner.open_bi().await.map_err(connection_lost)?;
        Ok((QuinnSend(send), QuinnRecv(recv)))
    }

    async fn accept_bi(&self) -> Result<(QuinnSend, QuinnRecv), StreamError> {
        let (send, recv) = self.inner.accept_bi().await.map_err(connection_lost)?;
        Ok((QuinnSend(send), QuinnRecv(recv)))
    }
}

/// Sending half of a quinn bidirectional stream.
#[derive(Debug)]
pub struct QuinnSend(pub quinn::SendStream);

impl SendHalf for QuinnSend {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), StreamError> {
        self.0.write_all(buf).await.map_err(write_error)
    }

    fn finish(&mut self) -> Result<(), StreamError> {
        self.0.finish().map_err(|_| StreamError::Closed)
    }

    fn reset(&mut self, code: u64) {
        if self.0.reset(varint(code)).is_err() {
            tracing::trace!(code, "reset on an already closed send stream");
        }
    }
}

/// Receiving half of a quinn bidirectional stream.
#[derive(Debug)]
pub struct QuinnRecv(pub quinn::RecvStream);

impl RecvHalf for QuinnRecv {
    async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, StreamError> {
        self.0.read(buf).await.map_err(read_error)
    }

    fn stop(&mut self, code: u64) {
        if self.0.stop(varint(code)).is_err() {
            tracing::trace!(code, "stop on an already closed recv stream");
        }
    }
}

fn varint(code: u64) -> VarInt {
    VarInt::from_u64(code).unwrap_or(VarInt::MAX)
}

fn connection_lost(err: quinn::ConnectionError) -> StreamError {
    match err {
        quinn::ConnectionError::ApplicationClosed(close) => StreamError::ConnectionLost {
            code: Some(close.error_code.into_inner()),
            reason: String::from_utf8_lossy(&close.reason).into_owned(),
        },
        other => StreamError::ConnectionLost {
            code: None,
            reason: other.to_string(),
        },
    }
}

fn write_error(err: quinn::WriteError) -> StreamError {
    match err {
        quinn::WriteError::Stopped(code) => StreamError::Stopped(code.into_inner()),
        quinn::WriteError::ConnectionLost(err) => connection_lost(err),
        quinn::WriteError::ClosedStream => StreamError::Closed,
        other => StreamError::ConnectionLost {
            code: None,
            reason: other.to_string(),
        },
    }
}

fn read_error(err: quinn::ReadError) -> StreamError {
    match err {
        quinn::ReadError::Reset(code) => StreamError::Reset(code.into_inner()),
        quinn::ReadError::ConnectionLost(err) => connection_lost(err),
        quinn::ReadError::ClosedStream => StreamError::Closed,
        other => StreamError::ConnectionLost {
            code: None,
            reason: other.to_string(),
        },
    }
}
