use std::fmt;

use crate::transport::StreamError;
use crate::wire::FunctionId;

/// Error taxonomy.
///
/// The discriminants double as transport application error codes when a
/// stream is aborted in both directions, so they must never change.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The remote handler failed.
    RemoteException = 1,
    /// Nothing is registered under the called identifier.
    FunctionNotFound = 2,
    /// The remote side cancelled the call or is shutting down.
    RemoteShutdown = 3,
    /// The response shape did not match the shape the caller expected.
    SignatureError = 4,
    /// Malformed header, or a transport failure without a known code.
    ProtocolError = 5,
}

impl ErrorKind {
    /// Convert from a transport application error code.
    /// Returns None if the value doesn't match a known kind.
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            1 => ErrorKind::RemoteException,
            2 => ErrorKind::FunctionNotFound,
            3 => ErrorKind::RemoteShutdown,
            4 => ErrorKind::SignatureError,
            5 => ErrorKind::ProtocolError,
            _ => return None,
        })
    }

    /// Like [`from_code`](Self::from_code), but only for the kinds a callee
    /// ever signals by aborting a stream.
    pub fn from_abort_code(code: u64) -> Option<Self> {
        ErrorKind::from_code(code).filter(|kind| kind.is_abort_kind())
    }

    /// Convert to a transport application error code.
    pub fn code(self) -> u64 {
        self as u64
    }

    /// Whether a callee signals this kind by aborting the stream.
    pub fn is_abort_kind(self) -> bool {
        matches!(
            self,
            ErrorKind::RemoteException | ErrorKind::FunctionNotFound | ErrorKind::RemoteShutdown
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::RemoteException => "remote handler failed",
            ErrorKind::FunctionNotFound => "function not found at remote",
            ErrorKind::RemoteShutdown => "remote shutting down",
            ErrorKind::SignatureError => "function signature differs from remote",
            ErrorKind::ProtocolError => "protocol error",
        }
    }
}

impl TryFrom<u64> for ErrorKind {
    type Error = UnknownErrorKind;

    fn try_from(code: u64) -> Result<Self, Self::Error> {
        ErrorKind::from_code(code).ok_or(UnknownErrorKind(code))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// Error when converting from an unknown code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownErrorKind(pub u64);

impl fmt::Display for UnknownErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown error kind: {}", self.0)
    }
}

impl std::error::Error for UnknownErrorKind {}

/// Error returned to a caller.
#[derive(Debug)]
pub struct RpcError {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RpcError {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        RpcError {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Map a transport failure seen by the caller.
    ///
    /// Abort codes a callee uses become the matching kind; everything else is
    /// a protocol error.
    pub fn from_stream(err: StreamError) -> Self {
        match err.application_code().and_then(ErrorKind::from_abort_code) {
            Some(ErrorKind::RemoteException) => {
                RpcError::remote_exception("invoke failed with an exception at remote")
            }
            Some(ErrorKind::FunctionNotFound) => {
                RpcError::function_not_found("function not found at remote")
            }
            Some(ErrorKind::RemoteShutdown) => RpcError::remote_shutdown("remote shutting down"),
            _ => RpcError::with_source(ErrorKind::ProtocolError, "transport failure", err),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl RpcError {
    pub fn remote_exception(message: impl Into<String>) -> Self {
        RpcError::new(ErrorKind::RemoteException, message)
    }

    pub fn function_not_found(message: impl Into<String>) -> Self {
        RpcError::new(ErrorKind::FunctionNotFound, message)
    }

    pub fn remote_shutdown(message: impl Into<String>) -> Self {
        RpcError::new(ErrorKind::RemoteShutdown, message)
    }

    pub fn signature(message: impl Into<String>) -> Self {
        RpcError::new(ErrorKind::SignatureError, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        RpcError::new(ErrorKind::ProtocolError, message)
    }
}

/// Registration failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// The slot already holds a handler; the existing one stays active.
    AlreadyRegistered(FunctionId),
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::AlreadyRegistered(id) => {
                write!(f, "function {id} is already registered")
            }
        }
    }
}

impl std::error::Error for RegisterError {}

/// Failure reported by user handler code.
///
/// Any `std::error::Error` converts into it, so handlers can use `?` freely.
/// [`HandlerError::cancelled`] is reported to the caller as
/// [`ErrorKind::RemoteShutdown`]; everything else as
/// [`ErrorKind::RemoteException`].
pub struct HandlerError {
    repr: HandlerRepr,
}

enum HandlerRepr {
    Cancelled,
    Failed(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl HandlerError {
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        HandlerError {
            repr: HandlerRepr::Failed(err.into()),
        }
    }

    /// The handler observed cancellation and gave up.
    pub fn cancelled() -> Self {
        HandlerError {
            repr: HandlerRepr::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.repr, HandlerRepr::Cancelled)
    }

    /// The underlying error, unless this is a cancellation.
    pub fn error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match &self.repr {
            HandlerRepr::Cancelled => None,
            HandlerRepr::Failed(err) => Some(err.as_ref()),
        }
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        HandlerError::new(err)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            HandlerRepr::Cancelled => f.write_str("HandlerError::Cancelled"),
            HandlerRepr::Failed(err) => f.debug_tuple("HandlerError::Failed").field(err).finish(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            HandlerRepr::Cancelled => f.write_str("handler cancelled"),
            HandlerRepr::Failed(err) => write!(f, "handler failed: {err}"),
        }
    }
}

/// Why [`Service::handle_connection`](crate::Service::handle_connection)
/// stopped accepting, when the caller asked to hear about it.
#[derive(Debug)]
pub enum ConnectionError {
    /// The transport stopped yielding streams.
    Closed(StreamError),
    /// The cancellation token fired.
    Cancelled,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Closed(err) => write!(f, "connection closed: {err}"),
            ConnectionError::Cancelled => write!(f, "connection handling cancelled"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Closed(err) => Some(err),
            ConnectionError::Cancelled => None,
        }
    }
}
