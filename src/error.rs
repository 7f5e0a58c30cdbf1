//! Error types surfaced by sessions and listeners.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by session and listener operations.
///
/// Per-packet problems (checksum mismatches, malformed segments) are *not* errors at
/// this level - they are counted in [`crate::snmp`] and the packet is dropped, as is
/// usual for datagram input. This enum covers the conditions a caller can meaningfully
/// react to.
#[derive(Debug, Clone, Error)]
pub enum BraidError {
    /// A read, write or accept deadline elapsed. Timeouts are temporary: the
    ///  operation may be retried with a later deadline.
    #[error("operation timed out")]
    Timeout,

    /// The session or listener has been closed, either by an earlier `close` call or
    ///  concurrently by the peer side of the API.
    #[error("closed session or listener")]
    ClosedPipe,

    /// The operation is not applicable in this role, e.g. retuning the shared socket
    ///  from a session that was accepted by a listener.
    #[error("invalid operation")]
    InvalidOperation,

    /// The socket escape hatch was invoked on a session that does not own its socket.
    #[error("not the owner of this socket")]
    NotOwner,

    /// The underlying socket failed while receiving. Latched: every subsequent read
    ///  returns the same error.
    #[error("socket read failed: {0}")]
    SocketRead(#[source] Arc<io::Error>),

    /// The underlying socket failed while sending. Latched: every subsequent write
    ///  returns the same error.
    #[error("socket write failed: {0}")]
    SocketWrite(#[source] Arc<io::Error>),
}

impl BraidError {
    /// true iff the error was caused by an elapsed deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, BraidError::Timeout)
    }

    /// true iff retrying the operation can succeed without re-establishing the session
    pub fn is_temporary(&self) -> bool {
        matches!(self, BraidError::Timeout)
    }
}
