#![allow(dead_code)]

use std::sync::Arc;

use quicrpc::{
    Client, ConnectionError, ConnectionOptions, MemoryConnection, Service, memory_connection_pair,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A service running on one end of an in-process connection, with a client on
/// the other end.
pub struct Harness {
    pub client: Client<MemoryConnection>,
    pub server: JoinHandle<Result<(), ConnectionError>>,
    pub cancel: CancellationToken,
}

impl Harness {
    /// Cancel the server and wait for it to drain.
    pub async fn shutdown(self) -> Result<(), ConnectionError> {
        self.cancel.cancel();
        self.server.await.expect("server task panicked")
    }
}

pub fn serve<T>(service: Service<T, MemoryConnection>, context: T) -> Harness
where
    T: Clone + Send + Sync + 'static,
{
    serve_with(service, context, ConnectionOptions::default())
}

pub fn serve_with<T>(
    service: Service<T, MemoryConnection>,
    context: T,
    options: ConnectionOptions,
) -> Harness
where
    T: Clone + Send + Sync + 'static,
{
    init_tracing();
    let (client_conn, server_conn) = memory_connection_pair();
    let service = Arc::new(service);
    let cancel = CancellationToken::new();
    let server = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            service
                .handle_connection(&server_conn, context, options, cancel)
                .await
        }
    });
    Harness {
        client: Client::new(client_conn),
        server,
        cancel,
    }
}
