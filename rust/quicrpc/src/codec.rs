//! Payload serialization seam.
//!
//! Payloads have no length prefix on the wire; a payload is whatever the writer
//! sent before half-closing. The codec always sees one whole payload.

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Encodes and decodes whole payloads.
pub trait Codec: Clone + Send + Sync + 'static {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode a complete payload. Trailing bytes are an error.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// Compact binary encoding via postcard.
#[derive(Clone, Copy, Debug, Default)]
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(value).map_err(|e| CodecError::new("encode", e))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let (value, rest) =
            postcard::take_from_bytes(bytes).map_err(|e| CodecError::new("decode", e))?;
        if !rest.is_empty() {
            return Err(CodecError::msg(format!(
                "decode: {} trailing bytes after payload",
                rest.len()
            )));
        }
        Ok(value)
    }
}

/// Serialization failure.
#[derive(Debug)]
pub struct CodecError {
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CodecError {
    pub fn new(context: &str, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        CodecError {
            message: format!("{context}: {source}"),
            source: Some(Box::new(source)),
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        CodecError {
            message: message.into(),
            source: None,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, serde::Deserialize, Debug, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
        label: String,
    }

    #[test]
    fn postcard_roundtrip() {
        let codec = PostcardCodec;
        let p = Point {
            x: -3,
            y: 7,
            label: "origin-ish".into(),
        };
        let bytes = codec.encode(&p).unwrap();
        let back: Point = codec.decode(&bytes).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let codec = PostcardCodec;
        let mut bytes = codec.encode(&5u32).unwrap();
        bytes.push(0);
        let err = codec.decode::<u32>(&bytes).unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let codec = PostcardCodec;
        let bytes = codec.encode("hello").unwrap();
        assert!(codec.decode::<String>(&bytes[..3]).is_err());
        assert!(codec.decode::<String>(&[]).is_err());
    }
}
