//! Dispatch table and handler registration.
//!
//! A [`Service`] owns a table with one slot per possible [`FunctionId`].
//! Registration wraps a typed user callback into a uniform [`Handler`] that
//! captures the codec calls for its request and response types, so the
//! per-stream engine never needs to know any payload type.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::callee::{Call, CallFailure, read_request, with_cancel, write_response};
use crate::caller::Caller;
use crate::codec::{Codec, PostcardCodec};
use crate::context::CallContext;
use crate::error::{HandlerError, RegisterError};
use crate::transport::Connection;
use crate::wire::{CallShape, FUNCTION_SLOTS, FunctionId, ResultCode};

/// Boxed, sendable future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type CallFn<T, C> = dyn Fn(Call<T, C>) -> BoxFuture<Result<(), CallFailure>> + Send + Sync;

/// Type-erased handler stored in a dispatch slot.
pub(crate) struct Handler<T, C: Connection> {
    pub(crate) shape: CallShape,
    pub(crate) call: Box<CallFn<T, C>>,
}

impl<T, C: Connection> Handler<T, C> {
    fn new<F>(shape: CallShape, call: F) -> Self
    where
        F: Fn(Call<T, C>) -> BoxFuture<Result<(), CallFailure>> + Send + Sync + 'static,
    {
        Handler {
            shape,
            call: Box::new(call),
        }
    }
}

/// One optional handler per possible function id.
pub struct DispatchTable<T, C: Connection> {
    slots: Box<[Option<Handler<T, C>>]>,
    len: usize,
}

impl<T, C: Connection> DispatchTable<T, C> {
    pub fn new() -> Self {
        DispatchTable {
            slots: std::iter::repeat_with(|| None)
                .take(FUNCTION_SLOTS)
                .collect(),
            len: 0,
        }
    }

    /// Install `handler`, leaving an existing registration untouched.
    pub(crate) fn insert(
        &mut self,
        id: FunctionId,
        handler: Handler<T, C>,
    ) -> Result<(), RegisterError> {
        let slot = &mut self.slots[id.slot()];
        if slot.is_some() {
            return Err(RegisterError::AlreadyRegistered(id));
        }
        *slot = Some(handler);
        self.len += 1;
        Ok(())
    }

    pub(crate) fn get(&self, id: FunctionId) -> Option<&Handler<T, C>> {
        self.slots.get(id.slot()).and_then(Option::as_ref)
    }

    /// Shape of the handler registered under `id`, if any.
    pub fn shape(&self, id: FunctionId) -> Option<CallShape> {
        self.get(id).map(|handler| handler.shape)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T, C: Connection> Default for DispatchTable<T, C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Service-wide settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Largest request or response payload accepted, in bytes.
    pub max_payload_len: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_payload_len: 16 * 1024 * 1024,
        }
    }
}

impl ServiceConfig {
    pub fn with_max_payload_len(mut self, max_payload_len: usize) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }
}

/// A set of handlers served on every connection passed to
/// [`handle_connection`](Service::handle_connection).
///
/// `T` is the per-connection value handlers see through
/// [`CallContext::connection`]. Register everything first, then wrap the
/// service in an `Arc`; registration needs `&mut self`, so it cannot race
/// with traffic.
pub struct Service<T, C: Connection, K = PostcardCodec> {
    table: DispatchTable<T, C>,
    codec: K,
    config: ServiceConfig,
}

impl<T, C> Service<T, C, PostcardCodec>
where
    T: Clone + Send + Sync + 'static,
    C: Connection,
{
    pub fn new() -> Self {
        Self::with_codec(PostcardCodec)
    }
}

impl<T, C> Default for Service<T, C, PostcardCodec>
where
    T: Clone + Send + Sync + 'static,
    C: Connection,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, C, K> Service<T, C, K>
where
    T: Clone + Send + Sync + 'static,
    C: Connection,
    K: Codec,
{
    /// Create an empty service that encodes payloads with `codec`.
    pub fn with_codec(codec: K) -> Self {
        Service {
            table: DispatchTable::new(),
            codec,
            config: ServiceConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn table(&self) -> &DispatchTable<T, C> {
        &self.table
    }

    pub fn codec(&self) -> &K {
        &self.codec
    }

    /// A caller using the same codec and payload limit as this service.
    pub fn caller(&self) -> Caller<K> {
        Caller::with_codec(self.codec.clone()).with_max_payload_len(self.config.max_payload_len)
    }

    /// Register a group of handlers in one go.
    pub fn bind<F>(&mut self, functions: Arc<F>) -> Result<(), RegisterError>
    where
        F: Functions<T, C, K>,
    {
        functions.bind(self)
    }

    /// No request, no response.
    pub fn register_empty<F, Fut>(&mut self, id: FunctionId, f: F) -> Result<(), RegisterError>
    where
        F: Fn(CallContext<T, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler = Handler::new(CallShape::Empty, move |call: Call<T, C>| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let ctx = CallContext::new(None, call.connection.clone(), call.cancel.clone());
                (*f)(ctx).await?;
                let header = call.header.with_result(ResultCode::Success);
                write_response(&call, header, &[]).await
            })
        });
        self.table.insert(id, handler)
    }

    /// Request only.
    pub fn register_request<Req, F, Fut>(
        &mut self,
        id: FunctionId,
        f: F,
    ) -> Result<(), RegisterError>
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(CallContext<T, C>, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let codec = self.codec.clone();
        let handler = Handler::new(CallShape::Request, move |call: Call<T, C>| {
            let f = Arc::clone(&f);
            let codec = codec.clone();
            Box::pin(async move {
                let req: Req = read_request(&call, &codec).await?;
                let ctx = CallContext::new(None, call.connection.clone(), call.cancel.clone());
                (*f)(ctx, req).await?;
                let header = call.header.with_result(ResultCode::Success);
                write_response(&call, header, &[]).await
            })
        });
        self.table.insert(id, handler)
    }

    /// Response only. The handler sees the stream while it runs.
    pub fn register_response<Resp, F, Fut>(
        &mut self,
        id: FunctionId,
        f: F,
    ) -> Result<(), RegisterError>
    where
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext<T, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let codec = self.codec.clone();
        let handler = Handler::new(CallShape::Response, move |call: Call<T, C>| {
            let f = Arc::clone(&f);
            let codec = codec.clone();
            Box::pin(async move {
                let ctx = CallContext::new(
                    Some(call.stream.clone()),
                    call.connection.clone(),
                    call.cancel.clone(),
                );
                let resp = (*f)(ctx).await?;
                let payload = codec.encode(&resp).map_err(HandlerError::from)?;
                let header = call.header.with_result(ResultCode::Response);
                write_response(&call, header, &payload).await
            })
        });
        self.table.insert(id, handler)
    }

    /// Request in, response out.
    pub fn register_request_response<Req, Resp, F, Fut>(
        &mut self,
        id: FunctionId,
        f: F,
    ) -> Result<(), RegisterError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext<T, C>, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let codec = self.codec.clone();
        let handler = Handler::new(CallShape::RequestResponse, move |call: Call<T, C>| {
            let f = Arc::clone(&f);
            let codec = codec.clone();
            Box::pin(async move {
                let req: Req = read_request(&call, &codec).await?;
                let ctx = CallContext::new(None, call.connection.clone(), call.cancel.clone());
                let resp = (*f)(ctx, req).await?;
                let payload = codec.encode(&resp).map_err(HandlerError::from)?;
                let header = call.header.with_result(ResultCode::Response);
                write_response(&call, header, &payload).await
            })
        });
        self.table.insert(id, handler)
    }

    /// Header handshake, then the stream belongs to the handler.
    ///
    /// The `Streaming` header is written before user code runs. Whatever the
    /// handler does with [`CallContext::stream`] afterwards is up to it; the
    /// stream is finished when the last handle is dropped.
    pub fn register_streaming<F, Fut>(&mut self, id: FunctionId, f: F) -> Result<(), RegisterError>
    where
        F: Fn(CallContext<T, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler = Handler::new(CallShape::Streaming, move |call: Call<T, C>| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                {
                    let header = call.header.with_result(ResultCode::Streaming).to_bytes();
                    let mut stream = call.stream.lock().await;
                    with_cancel(&call.cancel, stream.write_all(&header)).await?;
                }
                let ctx = CallContext::new(
                    Some(call.stream.clone()),
                    call.connection.clone(),
                    call.cancel.clone(),
                );
                (*f)(ctx).await.map_err(CallFailure::Handler)
            })
        });
        self.table.insert(id, handler)
    }
}

/// A group of related handlers that registers itself on a service.
///
/// ```ignore
/// struct Echo;
///
/// impl<C: Connection> Functions<(), C> for Echo {
///     fn bind(self: Arc<Self>, service: &mut Service<(), C>) -> Result<(), RegisterError> {
///         service.register_request_response(FunctionId::new(1, 0), |_ctx, s: String| async move {
///             Ok::<_, HandlerError>(s)
///         })
///     }
/// }
/// ```
pub trait Functions<T, C: Connection, K = PostcardCodec>: Send + Sync + 'static {
    fn bind(self: Arc<Self>, service: &mut Service<T, C, K>) -> Result<(), RegisterError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;

    type TestService = Service<(), MemoryConnection>;

    #[test]
    fn table_has_a_slot_for_every_id() {
        let table = DispatchTable::<(), MemoryConnection>::new();
        assert_eq!(table.slots.len(), FUNCTION_SLOTS);
        assert!(table.is_empty());
        assert_eq!(table.shape(FunctionId::from_raw(u16::MAX)), None);
    }

    #[test]
    fn duplicate_registration_keeps_first_handler() {
        let mut service = TestService::new();
        let id = FunctionId::from_raw(1);
        service
            .register_empty(id, |_ctx| async { Ok(()) })
            .unwrap();

        let err = service
            .register_request_response(id, |_ctx, s: String| async move { Ok(s) })
            .unwrap_err();
        assert_eq!(err, RegisterError::AlreadyRegistered(id));
        assert_eq!(service.table().shape(id), Some(CallShape::Empty));
        assert_eq!(service.table().len(), 1);
    }

    #[test]
    fn each_registration_records_its_shape() {
        let mut service = TestService::new();
        service
            .register_empty(FunctionId::new(0, 1), |_ctx| async { Ok(()) })
            .unwrap();
        service
            .register_request(FunctionId::new(0, 2), |_ctx, _n: u32| async { Ok(()) })
            .unwrap();
        service
            .register_response(FunctionId::new(0, 3), |_ctx| async { Ok(7u32) })
            .unwrap();
        service
            .register_request_response(FunctionId::new(0, 4), |_ctx, n: u32| async move {
                Ok(n + 1)
            })
            .unwrap();
        service
            .register_streaming(FunctionId::new(0, 5), |_ctx| async { Ok(()) })
            .unwrap();

        let table = service.table();
        assert_eq!(table.len(), 5);
        assert_eq!(table.shape(FunctionId::new(0, 1)), Some(CallShape::Empty));
        assert_eq!(table.shape(FunctionId::new(0, 2)), Some(CallShape::Request));
        assert_eq!(table.shape(FunctionId::new(0, 3)), Some(CallShape::Response));
        assert_eq!(
            table.shape(FunctionId::new(0, 4)),
            Some(CallShape::RequestResponse)
        );
        assert_eq!(table.shape(FunctionId::new(0, 5)), Some(CallShape::Streaming));
        assert_eq!(table.shape(FunctionId::new(0, 6)), None);
    }

    #[test]
    fn bind_registers_a_group() {
        struct Math;

        impl Functions<(), MemoryConnection> for Math {
            fn bind(
                self: Arc<Self>,
                service: &mut Service<(), MemoryConnection>,
            ) -> Result<(), RegisterError> {
                service.register_request_response(FunctionId::new(2, 0), |_ctx, n: i64| async move {
                    Ok(n * 2)
                })?;
                service.register_request_response(FunctionId::new(2, 1), |_ctx, n: i64| async move {
                    Ok(-n)
                })
            }
        }

        let mut service = TestService::new();
        service.bind(Arc::new(Math)).unwrap();
        assert_eq!(service.table().len(), 2);
        assert_eq!(
            service.bind(Arc::new(Math)),
            Err(RegisterError::AlreadyRegistered(FunctionId::new(2, 0)))
        );
    }
}
