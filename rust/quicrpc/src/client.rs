use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::caller::Caller;
use crate::codec::{Codec, PostcardCodec};
use crate::error::RpcError;
use crate::transport::{BiStream, Connection};
use crate::wire::FunctionId;

/// A [`Caller`] bound to one connection.
///
/// Every call opens a fresh bidirectional stream, so calls on one client can
/// run concurrently from many tasks.
pub struct Client<C, K = PostcardCodec> {
    connection: C,
    caller: Caller<K>,
}

impl<C: Connection> Client<C, PostcardCodec> {
    pub fn new(connection: C) -> Self {
        Client::with_caller(connection, Caller::new())
    }
}

impl<C: Connection, K: Codec> Client<C, K> {
    pub fn with_caller(connection: C, caller: Caller<K>) -> Self {
        Client { connection, caller }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn caller(&self) -> &Caller<K> {
        &self.caller
    }

    async fn open(&self) -> Result<BiStream<C>, RpcError> {
        BiStream::open(&self.connection)
            .await
            .map_err(RpcError::from_stream)
    }

    pub async fn empty(&self, id: FunctionId) -> Result<(), RpcError> {
        let mut stream = self.open().await?;
        self.caller.invoke_empty(&mut stream, id).await
    }

    pub async fn request<Req>(&self, id: FunctionId, request: &Req) -> Result<(), RpcError>
    where
        Req: Serialize + ?Sized,
    {
        let mut stream = self.open().await?;
        self.caller.invoke_request(&mut stream, id, request).await
    }

    pub async fn response<Resp>(&self, id: FunctionId) -> Result<Resp, RpcError>
    where
        Resp: DeserializeOwned,
    {
        let mut stream = self.open().await?;
        self.caller.invoke_response(&mut stream, id).await
    }

    pub async fn request_response<Req, Resp>(
        &self,
        id: FunctionId,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut stream = self.open().await?;
        self.caller
            .invoke_request_response(&mut stream, id, request)
            .await
    }

    /// Open a streaming call. The returned stream is the application's.
    pub async fn streaming(&self, id: FunctionId) -> Result<BiStream<C>, RpcError> {
        let stream = self.open().await?;
        self.caller.invoke_streaming(stream, id).await
    }
}
