//! Caller side of the per-stream protocol.
//!
//! Each `invoke_*` drives one call over a stream the application opened:
//! write the function id (and request), half-close unless streaming, then read
//! and check the response header against the expected [`CallShape`].

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::{Codec, PostcardCodec};
use crate::dispatch::ServiceConfig;
use crate::error::{ErrorKind, RpcError};
use crate::transport::{BiStream, Connection};
use crate::wire::{CallShape, FunctionId, HEADER_LEN, HeaderError, parse_response_header};

/// Issues calls with a fixed codec.
#[derive(Clone, Debug)]
pub struct Caller<K = PostcardCodec> {
    codec: K,
    max_payload_len: usize,
}

impl Caller<PostcardCodec> {
    pub fn new() -> Self {
        Caller::with_codec(PostcardCodec)
    }
}

impl Default for Caller<PostcardCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Codec> Caller<K> {
    pub fn with_codec(codec: K) -> Self {
        Caller {
            codec,
            max_payload_len: ServiceConfig::default().max_payload_len,
        }
    }

    /// Refuse response payloads larger than this many bytes.
    pub fn with_max_payload_len(mut self, max_payload_len: usize) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    pub fn codec(&self) -> &K {
        &self.codec
    }

    /// No request, no response.
    pub async fn invoke_empty<C: Connection>(
        &self,
        stream: &mut BiStream<C>,
        id: FunctionId,
    ) -> Result<(), RpcError> {
        self.send_header(stream, id, None).await?;
        self.expect(stream, id, CallShape::Empty).await
    }

    /// Request only.
    pub async fn invoke_request<C, Req>(
        &self,
        stream: &mut BiStream<C>,
        id: FunctionId,
        request: &Req,
    ) -> Result<(), RpcError>
    where
        C: Connection,
        Req: Serialize + ?Sized,
    {
        let payload = self.encode(request)?;
        self.send_header(stream, id, Some(&payload)).await?;
        self.expect(stream, id, CallShape::Request).await
    }

    /// Response only.
    pub async fn invoke_response<C, Resp>(
        &self,
        stream: &mut BiStream<C>,
        id: FunctionId,
    ) -> Result<Resp, RpcError>
    where
        C: Connection,
        Resp: DeserializeOwned,
    {
        self.send_header(stream, id, None).await?;
        self.expect(stream, id, CallShape::Response).await?;
        self.read_response(stream).await
    }

    /// Request in, response out.
    pub async fn invoke_request_response<C, Req, Resp>(
        &self,
        stream: &mut BiStream<C>,
        id: FunctionId,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        C: Connection,
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = self.encode(request)?;
        self.send_header(stream, id, Some(&payload)).await?;
        self.expect(stream, id, CallShape::RequestResponse).await?;
        self.read_response(stream).await
    }

    /// Perform the streaming handshake and hand the stream back.
    ///
    /// The write side is left open; from here on the bytes on the stream are
    /// the application's.
    pub async fn invoke_streaming<C: Connection>(
        &self,
        mut stream: BiStream<C>,
        id: FunctionId,
    ) -> Result<BiStream<C>, RpcError> {
        stream
            .write_all(&id.to_le_bytes())
            .await
            .map_err(RpcError::from_stream)?;
        self.expect(&mut stream, id, CallShape::Streaming).await?;
        Ok(stream)
    }

    fn encode<Req: Serialize + ?Sized>(&self, request: &Req) -> Result<Vec<u8>, RpcError> {
        self.codec.encode(request).map_err(|err| {
            RpcError::with_source(ErrorKind::ProtocolError, "failed to encode request", err)
        })
    }

    /// Write the header and optional payload, then half-close.
    async fn send_header<C: Connection>(
        &self,
        stream: &mut BiStream<C>,
        id: FunctionId,
        payload: Option<&[u8]>,
    ) -> Result<(), RpcError> {
        let header = id.to_le_bytes();
        let written = match payload {
            Some(payload) => {
                let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
                buf.extend_from_slice(&header);
                buf.extend_from_slice(payload);
                stream.write_all(&buf).await
            }
            None => stream.write_all(&header).await,
        };
        written.map_err(RpcError::from_stream)?;
        stream.finish().map_err(RpcError::from_stream)
    }

    /// Read the response header and check it matches `shape`.
    async fn expect<C: Connection>(
        &self,
        stream: &mut BiStream<C>,
        id: FunctionId,
        shape: CallShape,
    ) -> Result<(), RpcError> {
        let mut header = [0u8; HEADER_LEN];
        let first = stream
            .read(&mut header)
            .await
            .map_err(RpcError::from_stream)?;
        let n = match first {
            None | Some(0) => {
                return Err(RpcError::protocol(format!(
                    "remote service is not configured for function {id}"
                )));
            }
            Some(n) => n,
        };
        if n < HEADER_LEN {
            stream
                .read_exact(&mut header[n..])
                .await
                .map_err(RpcError::from_stream)?;
        }

        let expected = shape.result_code();
        match parse_response_header(header) {
            Ok(code) if code == expected => Ok(()),
            Ok(code) => Err(RpcError::signature(format!(
                "function {id}: expected {expected:?} response, got {code:?}"
            ))),
            Err(err @ HeaderError::UnknownResult(_)) => Err(RpcError::with_source(
                ErrorKind::SignatureError,
                format!("function {id}: expected {expected:?} response"),
                err,
            )),
            Err(err @ HeaderError::BadPlaceholder(_)) => Err(RpcError::with_source(
                ErrorKind::ProtocolError,
                "malformed response header",
                err,
            )),
        }
    }

    async fn read_response<C, Resp>(&self, stream: &mut BiStream<C>) -> Result<Resp, RpcError>
    where
        C: Connection,
        Resp: DeserializeOwned,
    {
        let payload = stream
            .read_to_end(self.max_payload_len)
            .await
            .map_err(RpcError::from_stream)?;
        self.codec.decode(&payload).map_err(|err| {
            RpcError::with_source(ErrorKind::ProtocolError, "failed to decode response", err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryConnection, memory_connection_pair};
    use crate::wire::PLACEHOLDER;

    async fn answer_with(bytes: &'static [&'static [u8]]) -> Result<u32, RpcError> {
        let (a, b) = memory_connection_pair();
        let peer = tokio::spawn(async move {
            let (send, recv) = b.accept_bi().await.unwrap();
            let mut stream = BiStream::<MemoryConnection>::new(send, recv);
            let mut header = [0u8; HEADER_LEN];
            stream.read_exact(&mut header).await.unwrap();
            for chunk in bytes {
                stream.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            stream.finish().unwrap();
            (b, stream)
        });

        let mut stream = BiStream::<MemoryConnection>::open(&a).await.unwrap();
        let res = Caller::new()
            .invoke_response(&mut stream, FunctionId::from_raw(1))
            .await;
        drop(peer.await.unwrap());
        res
    }

    #[tokio::test]
    async fn header_split_across_reads() {
        let res = answer_with(&[&[PLACEHOLDER], &[4], &[7]]).await;
        assert_eq!(res.unwrap(), 7);
    }

    #[tokio::test]
    async fn unknown_result_code_is_signature_error() {
        let res = answer_with(&[&[PLACEHOLDER, 9]]).await;
        assert_eq!(res.unwrap_err().kind(), ErrorKind::SignatureError);
    }

    #[tokio::test]
    async fn undecodable_response_is_protocol_error() {
        let res = answer_with(&[&[PLACEHOLDER, 4, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]]).await;
        assert_eq!(res.unwrap_err().kind(), ErrorKind::ProtocolError);
    }

    #[tokio::test]
    async fn header_cut_short_is_protocol_error() {
        let res = answer_with(&[&[PLACEHOLDER]]).await;
        assert_eq!(res.unwrap_err().kind(), ErrorKind::ProtocolError);
    }
}
