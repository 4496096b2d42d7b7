//! Typed RPC over the bidirectional streams of a QUIC-like connection.
//!
//! One call is one stream. The caller writes a 2-byte [`FunctionId`], an
//! optional request payload, and half-closes; the callee answers with a 2-byte
//! response header and an optional payload. Failures travel as stream aborts
//! whose application code is an [`ErrorKind`].
//!
//! - [`Service`]: dispatch table plus registration, one method per
//!   [`CallShape`], and [`Service::handle_connection`] to serve a connection.
//! - [`Caller`] / [`Client`]: the calling side.
//! - [`Connection`], [`SendHalf`], [`RecvHalf`]: the transport seam. The
//!   `quicrpc-quinn` crate implements it over quinn; [`memory_connection_pair`]
//!   implements it in-process.
//! - [`Codec`]: payload serialization, [`PostcardCodec`] by default.

mod callee;

mod caller;
pub use caller::*;

mod client;
pub use client::*;

mod codec;
pub use codec::*;

mod connection;
pub use connection::*;

mod context;
pub use context::*;

mod dispatch;
pub use dispatch::*;

mod error;
pub use error::*;

mod memory;
pub use memory::*;

mod tracker;

mod transport;
pub use transport::*;

mod wire;
pub use wire::*;
