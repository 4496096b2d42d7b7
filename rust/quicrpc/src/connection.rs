//! Serving a connection: accept streams, spawn a task per call, drain.
//!
//! [`Service::handle_connection`] runs the accept loop until the transport
//! stops yielding streams or the cancellation token fires, then waits for every
//! spawned call to finish before returning.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::callee::handle_stream;
use crate::codec::Codec;
use crate::dispatch::Service;
use crate::error::{ConnectionError, ErrorKind, HandlerError};
use crate::tracker::InFlight;
use crate::transport::{BiStream, Connection, StreamError};
use crate::wire::FunctionId;

/// Observer for handler failures that were reported to the caller as
/// [`ErrorKind::RemoteException`]. It cannot change the outcome of the call.
pub type ErrorHook = Arc<dyn Fn(FunctionId, &HandlerError) + Send + Sync>;

/// Per-connection settings for [`Service::handle_connection`].
#[derive(Clone, Default)]
pub struct ConnectionOptions {
    /// Return [`ConnectionError::Closed`] when the transport goes away.
    pub propagate_close: bool,
    /// Return [`ConnectionError::Cancelled`] when the token fires.
    pub propagate_cancel: bool,
    pub on_handler_error: Option<ErrorHook>,
}

impl ConnectionOptions {
    pub fn with_propagate_close(mut self, propagate: bool) -> Self {
        self.propagate_close = propagate;
        self
    }

    pub fn with_propagate_cancel(mut self, propagate: bool) -> Self {
        self.propagate_cancel = propagate;
        self
    }

    pub fn with_handler_error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(FunctionId, &HandlerError) + Send + Sync + 'static,
    {
        self.on_handler_error = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("propagate_close", &self.propagate_close)
            .field("propagate_cancel", &self.propagate_cancel)
            .field("on_handler_error", &self.on_handler_error.is_some())
            .finish()
    }
}

enum Exit {
    Closed(StreamError),
    Cancelled,
}

impl<T, C, K> Service<T, C, K>
where
    T: Clone + Send + Sync + 'static,
    C: Connection,
    K: Codec,
{
    /// Serve every stream the peer opens on `connection`.
    ///
    /// Each call runs in its own task and sees a clone of `context` plus
    /// `cancellation`. Returns once the accept loop has stopped and every call
    /// has finished. The exit reason is swallowed unless `options` asks for it.
    pub async fn handle_connection(
        self: &Arc<Self>,
        connection: &C,
        context: T,
        options: ConnectionOptions,
        cancellation: CancellationToken,
    ) -> Result<(), ConnectionError> {
        let in_flight = InFlight::new();

        let exit = loop {
            let accepted = tokio::select! {
                biased;
                _ = cancellation.cancelled() => None,
                accepted = connection.accept_bi() => Some(accepted),
            };
            let Some(accepted) = accepted else {
                break Exit::Cancelled;
            };
            let (send, recv) = match accepted {
                Ok(halves) => halves,
                Err(err) => break Exit::Closed(err),
            };

            let mut stream = BiStream::<C>::new(send, recv);
            if cancellation.is_cancelled() {
                stream.abort(ErrorKind::RemoteShutdown.code());
                break Exit::Cancelled;
            }

            let guard = in_flight.enter();
            trace!(in_flight = in_flight.count(), "accepted stream");
            let service = Arc::clone(self);
            let context = context.clone();
            let on_error = options.on_handler_error.clone();
            let cancel = cancellation.clone();
            tokio::spawn(async move {
                let _guard = guard;
                handle_stream(service, stream, context, on_error, cancel).await;
            });
        };

        match &exit {
            Exit::Closed(err) => debug!(error = %err, "connection closed, draining"),
            Exit::Cancelled => debug!("connection cancelled, draining"),
        }
        in_flight.wait().await;
        debug!("connection drained");

        match exit {
            Exit::Closed(err) if options.propagate_close => Err(ConnectionError::Closed(err)),
            Exit::Cancelled if options.propagate_cancel => Err(ConnectionError::Cancelled),
            _ => Ok(()),
        }
    }
}
