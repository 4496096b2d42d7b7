//! Calls over a real QUIC connection on the loopback interface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quicrpc::{Client, ConnectionOptions, ErrorKind, FunctionId, HandlerError, Service};
use quicrpc_quinn::QuinnConnection;
use quinn::rustls::RootCertStore;
use quinn::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const ECHO: FunctionId = FunctionId::new(0, 1);
const SLOW: FunctionId = FunctionId::new(0, 2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Both endpoints of one loopback connection. The endpoints stay alive as
/// long as this does.
struct Loopback {
    _server_endpoint: quinn::Endpoint,
    _client_endpoint: quinn::Endpoint,
    server: QuinnConnection,
    client: QuinnConnection,
}

async fn connect() -> Loopback {
    init_tracing();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

    let server_config = quinn::ServerConfig::with_single_cert(vec![cert_der.clone()], key).unwrap();
    let localhost: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server_endpoint = quinn::Endpoint::server(server_config, localhost).unwrap();
    let server_addr = server_endpoint.local_addr().unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client_config = quinn::ClientConfig::with_root_certificates(Arc::new(roots)).unwrap();
    let mut client_endpoint = quinn::Endpoint::client(localhost).unwrap();
    client_endpoint.set_default_client_config(client_config);

    let connecting = client_endpoint.connect(server_addr, "localhost").unwrap();
    let (client, server) = tokio::join!(connecting, async {
        server_endpoint.accept().await.unwrap().await
    });

    Loopback {
        _server_endpoint: server_endpoint,
        _client_endpoint: client_endpoint,
        server: QuinnConnection::new(server.unwrap()),
        client: QuinnConnection::new(client.unwrap()),
    }
}

fn service(finished: Arc<std::sync::atomic::AtomicBool>) -> Service<(), QuinnConnection> {
    let mut service = Service::new();
    service
        .register_request_response(ECHO, |_ctx, s: String| async move { Ok(s) })
        .unwrap();
    service
        .register_request_response(SLOW, move |ctx, _req: String| {
            let finished = finished.clone();
            async move {
                ctx.cancellation().cancelled().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                finished.store(true, std::sync::atomic::Ordering::SeqCst);
                Err::<String, _>(HandlerError::cancelled())
            }
        })
        .unwrap();
    service
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn calls_over_quic() {
    let Loopback {
        _server_endpoint,
        _client_endpoint,
        server,
        client,
    } = connect().await;

    let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let service = Arc::new(service(finished.clone()));
    let cancel = CancellationToken::new();
    // The connection closes when its last handle drops, so keep one here.
    let serving = tokio::spawn({
        let cancel = cancel.clone();
        let server = server.clone();
        async move {
            service
                .handle_connection(&server, (), ConnectionOptions::default(), cancel)
                .await
        }
    });

    let client = Arc::new(Client::new(client));

    let reply: String = client.request_response(ECHO, "Quic").await.unwrap();
    assert_eq!(reply, "Quic");

    let err = client
        .request_response::<_, String>(FunctionId::new(7, 7), "Quic")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FunctionNotFound);

    let slow = tokio::spawn({
        let client = client.clone();
        async move { client.request_response::<_, String>(SLOW, "Quic").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let err = slow.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteShutdown);
    serving.await.unwrap().unwrap();
    server.close(0, "done");
    assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_over_quic() {
    let link = connect().await;

    let mut service = Service::<(), QuinnConnection>::new();
    service
        .register_streaming(ECHO, |ctx| async move {
            let handle = ctx
                .stream()
                .cloned()
                .ok_or_else(|| HandlerError::new("streaming call without a stream"))?;
            let mut stream = handle.lock().await;
            let mut frame = [0u8; 4];
            stream.read_exact(&mut frame).await?;
            let value = i32::from_le_bytes(frame) + 10;
            stream.write_all(&value.to_le_bytes()).await?;
            stream.finish()?;
            Ok::<(), HandlerError>(())
        })
        .unwrap();
    let service = Arc::new(service);
    let cancel = CancellationToken::new();
    let serving = tokio::spawn({
        let cancel = cancel.clone();
        let server = link.server.clone();
        async move {
            service
                .handle_connection(&server, (), ConnectionOptions::default(), cancel)
                .await
        }
    });

    let client = Client::new(link.client.clone());
    let mut stream = client.streaming(ECHO).await.unwrap();
    stream.write_all(&32i32.to_le_bytes()).await.unwrap();
    stream.finish().unwrap();
    let bytes = stream.read_to_end(64).await.unwrap();
    assert_eq!(bytes, 42i32.to_le_bytes());

    cancel.cancel();
    serving.await.unwrap().unwrap();
}
