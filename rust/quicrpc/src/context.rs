use tokio_util::sync::CancellationToken;

use crate::transport::{Connection, StreamHandle};

/// Per-call state handed to every handler.
///
/// Built fresh for each accepted stream. `connection` is the value the
/// application passed to [`Service::handle_connection`](crate::Service::handle_connection),
/// typically its own per-connection state. `cancellation` fires when the
/// connection is being shut down; handlers that may run for a while should
/// watch it and return [`HandlerError::cancelled`](crate::HandlerError::cancelled).
pub struct CallContext<T, C: Connection> {
    stream: Option<StreamHandle<C>>,
    connection: T,
    cancellation: CancellationToken,
}

impl<T, C: Connection> CallContext<T, C> {
    pub(crate) fn new(
        stream: Option<StreamHandle<C>>,
        connection: T,
        cancellation: CancellationToken,
    ) -> Self {
        CallContext {
            stream,
            connection,
            cancellation,
        }
    }

    /// The call's stream. Present for streaming and response-only handlers.
    pub fn stream(&self) -> Option<&StreamHandle<C>> {
        self.stream.as_ref()
    }

    pub fn connection(&self) -> &T {
        &self.connection
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn into_connection(self) -> T {
        self.connection
    }
}
