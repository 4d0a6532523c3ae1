//! The error module contains the taxonomy of failures the vhost offload
//! subsystem can report, and the `Result` alias used throughout the crate.

use std::io;

/// Custom defined [`std::result::Result`].
pub type Result<T> = std::result::Result<T, VhostError>;

/// All the ways a lifecycle or transport operation can fail.
///
/// Every lifecycle call (§7 of the design) returns a single success/failure
/// result; callers are guaranteed that partial progress has already been
/// unwound by the time an `Err` reaches them.
#[derive(Debug, thiserror::Error)]
pub enum VhostError {
    /// The selected transport does not implement the requested operation.
    #[error("operation `{op}` is not supported by this transport")]
    CapabilityUnavailable {
        /// Name of the unsupported operation.
        op: &'static str,
    },

    /// A syscall (ioctl, send, recv, read) returned an error that survived
    /// `EINTR`/`EAGAIN` retry.
    #[error("transport I/O failed during `{op}`: {source}")]
    TransportIo {
        /// Name of the operation that failed.
        op: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A reply's framing does not match the request.
    #[error("protocol violation: {detail}")]
    ProtocolViolation {
        /// Human-readable description of the mismatch.
        detail: String,
    },

    /// The caller invoked a lifecycle operation out of order or with
    /// arguments the state machine rejects.
    #[error("state violation: {detail}")]
    StateViolation {
        /// Human-readable description of the violated precondition.
        detail: String,
    },

    /// Allocation of a local resource (an eventfd, the memory table) failed.
    #[error("resource exhausted: {detail}")]
    ResourceExhausted {
        /// Human-readable description of what could not be allocated.
        detail: String,
    },
}

impl VhostError {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        VhostError::TransportIo { op, source }
    }

    pub(crate) fn proto(detail: impl Into<String>) -> Self {
        VhostError::ProtocolViolation {
            detail: detail.into(),
        }
    }

    pub(crate) fn state(detail: impl Into<String>) -> Self {
        VhostError::StateViolation {
            detail: detail.into(),
        }
    }

    pub(crate) fn exhausted(detail: impl Into<String>) -> Self {
        VhostError::ResourceExhausted {
            detail: detail.into(),
        }
    }
}

/// Runs `f`, retrying while it fails with `EINTR` or `EAGAIN`/`EWOULDBLOCK`,
/// and wrapping any other failure as a [`VhostError::TransportIo`].
///
/// Per §5, the user transport's blocking `sendmsg`/`recvmsg`/`read` calls are
/// the only suspension points in this crate, and they must be retried on
/// these two errno values rather than surfaced to the caller.
pub(crate) fn retry_on_intr<T>(op: &'static str, mut f: impl FnMut() -> io::Result<T>) -> Result<T> {
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(VhostError::io(op, e)),
        }
    }
}
