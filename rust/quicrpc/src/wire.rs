//! Per-stream wire format.
//!
//! Every call occupies exactly one bidirectional stream. The caller opens it
//! with a 2-byte little-endian [`FunctionId`]; the callee answers with a 2-byte
//! response header whose first byte is always [`PLACEHOLDER`] and whose second
//! byte is a [`ResultCode`]. Payloads follow the headers directly, without a
//! length prefix: a payload ends when its writer half-closes the stream.

use std::fmt;

/// Length of both the request and the response header.
pub const HEADER_LEN: usize = 2;

/// Sentinel written as byte 0 of every response header.
pub const PLACEHOLDER: u8 = 0x78;

/// Number of addressable functions (the whole `u16` space).
pub const FUNCTION_SLOTS: usize = 1 << 16;

/// Identifier of a registered function.
///
/// Conventionally the high byte is a group id and the low byte a method id
/// within that group, but the runtime only ever uses the flat 16-bit value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct FunctionId(u16);

impl FunctionId {
    /// Compose an id from a group id and a method id.
    pub const fn new(group: u8, method: u8) -> Self {
        FunctionId(((group as u16) << 8) | method as u16)
    }

    pub const fn from_raw(raw: u16) -> Self {
        FunctionId(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn group(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn method(self) -> u8 {
        self.0 as u8
    }

    /// Encode as a request header.
    pub const fn to_le_bytes(self) -> [u8; HEADER_LEN] {
        self.0.to_le_bytes()
    }

    /// Decode a request header.
    pub const fn from_le_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        FunctionId(u16::from_le_bytes(bytes))
    }

    pub(crate) const fn slot(self) -> usize {
        self.0 as usize
    }
}

impl From<u16> for FunctionId {
    fn from(raw: u16) -> Self {
        FunctionId(raw)
    }
}

impl From<FunctionId> for u16 {
    fn from(id: FunctionId) -> u16 {
        id.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group(), self.method())
    }
}

/// Result code carried in byte 1 of a response header.
///
/// `FunctionNotFound` and `Exception` are part of the code space but are never
/// written by this runtime: those outcomes travel as stream abort codes.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ResultCode {
    /// Call completed, no payload follows.
    Success = 0,
    FunctionNotFound = 1,
    Exception = 2,
    /// Handshake done; the stream now belongs to the application.
    Streaming = 3,
    /// A payload follows.
    Response = 4,
}

impl ResultCode {
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0 => ResultCode::Success,
            1 => ResultCode::FunctionNotFound,
            2 => ResultCode::Exception,
            3 => ResultCode::Streaming,
            4 => ResultCode::Response,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Response header under construction on the callee side.
///
/// Built from the request header buffer: byte 0 is overwritten with the
/// placeholder and byte 1 is filled in once the handler knows its outcome.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ResponseHeader([u8; HEADER_LEN]);

impl ResponseHeader {
    pub fn from_request(mut header: [u8; HEADER_LEN]) -> Self {
        header[0] = PLACEHOLDER;
        ResponseHeader(header)
    }

    pub fn with_result(mut self, code: ResultCode) -> Self {
        self.0[1] = code.as_u8();
        self
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        self.0
    }
}

/// What went wrong decoding a response header on the caller side.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeaderError {
    /// Byte 0 was not [`PLACEHOLDER`].
    BadPlaceholder(u8),
    /// Byte 1 is outside the result code space.
    UnknownResult(u8),
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::BadPlaceholder(b) => write!(f, "bad response placeholder 0x{b:02x}"),
            HeaderError::UnknownResult(b) => write!(f, "unknown result code {b}"),
        }
    }
}

impl std::error::Error for HeaderError {}

/// Decode a response header received by the caller.
pub fn parse_response_header(header: [u8; HEADER_LEN]) -> Result<ResultCode, HeaderError> {
    if header[0] != PLACEHOLDER {
        return Err(HeaderError::BadPlaceholder(header[0]));
    }
    ResultCode::from_u8(header[1]).ok_or(HeaderError::UnknownResult(header[1]))
}

/// The five request/response combinations a handler can be registered as.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CallShape {
    /// No request, no response.
    Empty,
    /// Request only.
    Request,
    /// Response only.
    Response,
    RequestResponse,
    /// Header handshake, then free-form duplex bytes.
    Streaming,
}

impl CallShape {
    /// The result code a callee registered with this shape answers with.
    pub fn result_code(self) -> ResultCode {
        match self {
            CallShape::Empty | CallShape::Request => ResultCode::Success,
            CallShape::Response | CallShape::RequestResponse => ResultCode::Response,
            CallShape::Streaming => ResultCode::Streaming,
        }
    }

    pub fn has_request(self) -> bool {
        matches!(self, CallShape::Request | CallShape::RequestResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_id_composes_group_and_method() {
        let id = FunctionId::new(0x12, 0x34);
        assert_eq!(id.raw(), 0x1234);
        assert_eq!(id.group(), 0x12);
        assert_eq!(id.method(), 0x34);
        assert_eq!(id.to_string(), "18:52");
    }

    #[test]
    fn request_header_is_little_endian() {
        let id = FunctionId::from_raw(0x0102);
        assert_eq!(id.to_le_bytes(), [0x02, 0x01]);
        assert_eq!(FunctionId::from_le_bytes([0x02, 0x01]), id);
        assert_eq!(FunctionId::from_le_bytes([1, 0]).raw(), 1);
    }

    #[test]
    fn response_header_reuses_request_buffer() {
        let header = ResponseHeader::from_request([0x01, 0x00]).with_result(ResultCode::Response);
        assert_eq!(header.to_bytes(), [0x78, 4]);
    }

    #[test]
    fn result_code_values_are_fixed() {
        assert_eq!(ResultCode::Success as u8, 0);
        assert_eq!(ResultCode::FunctionNotFound as u8, 1);
        assert_eq!(ResultCode::Exception as u8, 2);
        assert_eq!(ResultCode::Streaming as u8, 3);
        assert_eq!(ResultCode::Response as u8, 4);
        assert_eq!(ResultCode::from_u8(5), None);
    }

    #[test]
    fn parse_response_header_checks_placeholder() {
        assert_eq!(parse_response_header([0x78, 0]), Ok(ResultCode::Success));
        assert_eq!(
            parse_response_header([0x00, 0]),
            Err(HeaderError::BadPlaceholder(0))
        );
        assert_eq!(
            parse_response_header([0x78, 9]),
            Err(HeaderError::UnknownResult(9))
        );
    }

    #[test]
    fn call_shape_result_codes() {
        assert_eq!(CallShape::Empty.result_code(), ResultCode::Success);
        assert_eq!(CallShape::Request.result_code(), ResultCode::Success);
        assert_eq!(CallShape::Response.result_code(), ResultCode::Response);
        assert_eq!(CallShape::RequestResponse.result_code(), ResultCode::Response);
        assert_eq!(CallShape::Streaming.result_code(), ResultCode::Streaming);
        assert!(CallShape::RequestResponse.has_request());
        assert!(!CallShape::Streaming.has_request());
    }
}
