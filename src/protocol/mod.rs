//! Call/response convention between the shim and the device process.
//!
//! Every device operation is one message: call name, positional
//! arguments, an end-of-message delimiter. The peer executes it and
//! answers with an acknowledgement plus call-specific results. There is
//! no pipelining; one request is in flight per channel at a time.

pub mod calls;
pub mod codec;

use crate::error::ShimResult;

/// One side of the channel to the device process.
///
/// `send` delivers a complete framed message; `recv` blocks for the
/// peer's framed response. Implementations: the Unix-socket channel owned
/// by the session supervisor, and the in-process loopback peer used when
/// the simulator is not launched.
pub trait Transport: Send {
    fn send(&mut self, frame: &[u8]) -> ShimResult<()>;
    fn recv(&mut self) -> ShimResult<Vec<u8>>;
}

pub use codec::{Message, Reader, MESSAGE_END};
