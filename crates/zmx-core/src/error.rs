//! Error taxonomy for the client/daemon protocol.

use std::fmt;
use std::io;

/// Classified failure, mapped from OS errors at the I/O boundary.
///
/// The propagation policy lives with the callers: transient errors retry
/// on the next poll, peer-gone and malformed close one client, fatal
/// errors on the PTY or listener shut the daemon down, and the rest
/// surface to the CLI as a single line.
#[derive(Debug)]
pub enum ZmxError {
    /// EAGAIN / EWOULDBLOCK; retry on the next poll wakeup.
    IoTransient,
    /// Any other read/write failure.
    IoFatal(io::Error),
    /// EPIPE / ECONNRESET on a client socket; clean disconnect.
    PeerGone,
    /// Frame tag out of range, oversize length, or payload wrong for tag.
    Malformed(String),
    /// A socket file whose probe failed; safe to unlink.
    StaleSocket(String),
    /// No such session.
    NotFound(String),
    /// A session with this name is already running.
    AlreadyExists(String),
    /// Probe or history deadline expired.
    Timeout(&'static str),
    /// exec failed in the spawned child; never propagates past `_exit`.
    Unrecoverable(String),
}

impl fmt::Display for ZmxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZmxError::IoTransient => write!(f, "resource temporarily unavailable"),
            ZmxError::IoFatal(e) => write!(f, "i/o error: {}", e),
            ZmxError::PeerGone => write!(f, "peer disconnected"),
            ZmxError::Malformed(what) => write!(f, "malformed frame: {}", what),
            ZmxError::StaleSocket(name) => write!(f, "stale socket for session '{}'", name),
            ZmxError::NotFound(name) => write!(f, "no session named '{}'", name),
            ZmxError::AlreadyExists(name) => write!(f, "session '{}' already exists", name),
            ZmxError::Timeout(op) => write!(f, "{} timed out", op),
            ZmxError::Unrecoverable(what) => write!(f, "unrecoverable: {}", what),
        }
    }
}

impl std::error::Error for ZmxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ZmxError::IoFatal(e) => Some(e),
            _ => None,
        }
    }
}

impl ZmxError {
    /// Bucket an `io::Error` per the propagation policy.
    pub fn classify(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => ZmxError::IoTransient,
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => ZmxError::PeerGone,
            _ => ZmxError::IoFatal(err),
        }
    }

    /// True when the affected client should be dropped but the daemon
    /// keeps running.
    pub fn closes_client_only(&self) -> bool {
        matches!(self, ZmxError::PeerGone | ZmxError::Malformed(_))
    }
}

impl From<io::Error> for ZmxError {
    fn from(err: io::Error) -> Self {
        ZmxError::classify(err)
    }
}
