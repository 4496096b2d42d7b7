//! Callee side of the per-stream protocol.
//!
//! One accepted stream is one call: read the function id, look it up, run the
//! handler, and turn any failure into a stream abort carrying the matching
//! [`ErrorKind`] code.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::Codec;
use crate::connection::ErrorHook;
use crate::dispatch::Service;
use crate::error::{ErrorKind, HandlerError};
use crate::transport::{BiStream, Connection, StreamError, StreamHandle};
use crate::wire::{FunctionId, HEADER_LEN, ResponseHeader};

/// Everything a registered handler receives for one call.
pub(crate) struct Call<T, C: Connection> {
    pub(crate) stream: StreamHandle<C>,
    pub(crate) connection: T,
    pub(crate) header: ResponseHeader,
    pub(crate) cancel: CancellationToken,
    pub(crate) max_payload_len: usize,
}

/// How a call ended, when it did not end well.
pub(crate) enum CallFailure {
    /// The stream or connection failed under us. Nothing to report.
    Transport(StreamError),
    /// Cancellation fired while the runtime was doing stream IO.
    Shutdown,
    /// User code, or encoding on its behalf, failed.
    Handler(HandlerError),
}

impl From<HandlerError> for CallFailure {
    fn from(err: HandlerError) -> Self {
        CallFailure::Handler(err)
    }
}

/// Race runtime-owned stream IO against the cancellation token.
pub(crate) async fn with_cancel<R>(
    cancel: &CancellationToken,
    io: impl Future<Output = Result<R, StreamError>>,
) -> Result<R, CallFailure> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CallFailure::Shutdown),
        res = io => res.map_err(CallFailure::Transport),
    }
}

/// Read the whole request payload and decode it.
pub(crate) async fn read_request<Req, T, C, K>(
    call: &Call<T, C>,
    codec: &K,
) -> Result<Req, CallFailure>
where
    Req: serde::de::DeserializeOwned,
    C: Connection,
    K: Codec,
{
    let bytes = {
        let mut stream = call.stream.lock().await;
        match with_cancel(&call.cancel, stream.read_to_end(call.max_payload_len)).await {
            Ok(bytes) => bytes,
            Err(CallFailure::Transport(err @ StreamError::PayloadTooLarge { .. })) => {
                return Err(HandlerError::from(err).into());
            }
            Err(other) => return Err(other),
        }
    };
    codec
        .decode(&bytes)
        .map_err(|err| HandlerError::from(err).into())
}

/// Write the response header and payload in one go, then half-close.
pub(crate) async fn write_response<T, C: Connection>(
    call: &Call<T, C>,
    header: ResponseHeader,
    payload: &[u8],
) -> Result<(), CallFailure> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);

    let mut stream = call.stream.lock().await;
    with_cancel(&call.cancel, stream.write_all(&buf)).await?;
    stream.finish().map_err(CallFailure::Transport)
}

/// Serve one accepted stream to completion.
pub(crate) async fn handle_stream<T, C, K>(
    service: Arc<Service<T, C, K>>,
    mut stream: BiStream<C>,
    connection: T,
    on_error: Option<ErrorHook>,
    cancel: CancellationToken,
) where
    T: Clone + Send + Sync + 'static,
    C: Connection,
    K: Codec,
{
    let mut header = [0u8; HEADER_LEN];
    match with_cancel(&cancel, stream.read_exact(&mut header)).await {
        Ok(()) => {}
        Err(CallFailure::Shutdown) => {
            stream.abort(ErrorKind::RemoteShutdown.code());
            return;
        }
        Err(CallFailure::Transport(err)) => {
            trace!(error = %err, "stream closed before a full header, discarding");
            return;
        }
        Err(CallFailure::Handler(_)) => return,
    }

    let id = FunctionId::from_le_bytes(header);
    let Some(handler) = service.table().get(id) else {
        debug!(function_id = %id, "no handler registered");
        stream.abort(ErrorKind::FunctionNotFound.code());
        return;
    };
    trace!(function_id = %id, shape = ?handler.shape, "dispatching");

    let handle = StreamHandle::new(stream);
    let call = Call {
        stream: handle.clone(),
        connection,
        header: ResponseHeader::from_request(header),
        cancel: cancel.clone(),
        max_payload_len: service.config().max_payload_len,
    };

    let outcome = match AssertUnwindSafe((handler.call)(call)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(CallFailure::Handler(HandlerError::new(panic_message(&*panic)))),
    };

    let code = match outcome {
        Ok(()) => {
            trace!(function_id = %id, "call complete");
            return;
        }
        Err(CallFailure::Transport(err)) => {
            debug!(function_id = %id, error = %err, "stream failed during call");
            return;
        }
        Err(CallFailure::Shutdown) => ErrorKind::RemoteShutdown,
        Err(CallFailure::Handler(err)) if err.is_cancelled() || cancel.is_cancelled() => {
            debug!(function_id = %id, error = %err, "handler stopped during shutdown");
            ErrorKind::RemoteShutdown
        }
        Err(CallFailure::Handler(err)) if transport_failure(&err).is_some() => {
            debug!(function_id = %id, error = %err, "stream failed under the handler");
            return;
        }
        Err(CallFailure::Handler(err)) => {
            warn!(function_id = %id, error = %err, "handler failed");
            if let Some(hook) = &on_error {
                hook(id, &err);
            }
            ErrorKind::RemoteException
        }
    };

    debug!(function_id = %id, kind = ?code, "aborting call");
    match handle.try_lock() {
        Ok(mut stream) => stream.abort(code.code()),
        Err(_) => debug!(function_id = %id, "stream still held by user code, dropping without abort"),
    }
}

/// The stream error a handler propagated with `?`, if that is what failed.
///
/// An oversized payload is the handler's own limit, not a transport failure.
fn transport_failure(err: &HandlerError) -> Option<&StreamError> {
    err.error()
        .and_then(|err| err.downcast_ref::<StreamError>())
        .filter(|err| !matches!(err, StreamError::PayloadTooLarge { .. }))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {msg}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_errors_from_handlers_are_transport_failures() {
        let reset = HandlerError::from(StreamError::Reset(77));
        assert_eq!(transport_failure(&reset), Some(&StreamError::Reset(77)));

        let too_large = HandlerError::from(StreamError::PayloadTooLarge { limit: 4 });
        assert_eq!(transport_failure(&too_large), None);

        assert_eq!(transport_failure(&HandlerError::new("bad input")), None);
        assert_eq!(transport_failure(&HandlerError::cancelled()), None);
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(&"boom"), "handler panicked: boom");
        assert_eq!(
            panic_message(&String::from("bad state")),
            "handler panicked: bad state"
        );
        assert_eq!(panic_message(&7u32), "handler panicked");
    }
}
