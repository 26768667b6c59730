//! Error taxonomy — one variant per failure mode named in the handshake
//! and duplex contracts. Idle timeout is deliberately *not* one of these:
//! it terminates a session without being a fault (see `SessionOutcome`).

use std::io;
use thiserror::Error;

/// A failure that ends a session. Each variant closes both sockets; none
/// of them cross a session boundary (one session's error never touches
/// another).
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed or unsupported StartupMessage from the client.
    #[error("startup: {0}")]
    Startup(String),

    /// Directory service unreachable, unauthorized, or returned invalid
    /// coordinates.
    #[error("resolver: {0}")]
    Resolver(String),

    /// Could not reach the resolved backend.
    #[error("backend dial: {0}")]
    BackendDial(#[source] io::Error),

    /// Backend sent something other than the expected MD5 challenge, or
    /// I/O failed during the handshake.
    #[error("handshake: {0}")]
    Handshake(String),

    /// I/O error during the post-handshake duplex pipe.
    #[error("stream: {0}")]
    Stream(#[source] io::Error),
}

/// How a session ended. Distinguishes fault from the two non-error
/// terminations (clean EOF and idle-deadline expiry) so the caller can log
/// each at the right level without treating a timeout as a bug.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Either side closed cleanly; no bytes were lost.
    Closed,
    /// The idle deadline elapsed before the client sent anything.
    TimedOut,
    /// A `ProxyError` ended the session.
    Failed(ProxyError),
}

impl From<ProxyError> for SessionOutcome {
    fn from(err: ProxyError) -> Self {
        SessionOutcome::Failed(err)
    }
}
