//! Error kinds, as catalogued in the error handling design (§7): one variant
//! per failure origin, each with a fixed policy enforced by the caller
//! (`event_loop`, `proxy`) rather than by this type itself.
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// Listener bind/listen failed. Fatal; surfaced to the caller on `Proxy` entry.
    BindFailed(io::Error),
    /// `accept()` failed. Logged; the loop continues.
    AcceptFailed(io::Error),
    /// Connect to upstream failed or never completed. Deferred: surfaces as
    /// `BrokenPipe` on the session's first write attempt toward upstream.
    UpstreamConnectFailed,
    /// `recv` returned 0 bytes. Expected; drives half-close transitions.
    PeerClosed,
    /// `send` raised a pipe error. The opposite side is closed and its
    /// pending bytes for that direction are dropped.
    BrokenPipe,
    /// Endpoint string failed to parse. Fatal at construction.
    MalformedEndpoint(String),
    /// A `Handler` callback panicked or otherwise misbehaved. The session is
    /// aborted (both sides closed); the loop continues.
    HandlerError(String),
    /// An unrecoverable I/O driver error. Fatal; re-raised from `wait_for`.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BindFailed(e) => write!(f, "failed to bind downstream listener: {e}"),
            Error::AcceptFailed(e) => write!(f, "failed to accept downstream connection: {e}"),
            Error::UpstreamConnectFailed => write!(f, "failed to connect to upstream"),
            Error::PeerClosed => write!(f, "peer closed its write half"),
            Error::BrokenPipe => write!(f, "broken pipe"),
            Error::MalformedEndpoint(s) => write!(f, "malformed endpoint: {s}"),
            Error::HandlerError(s) => write!(f, "handler error: {s}"),
            Error::Io(e) => write!(f, "I/O driver error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::BindFailed(e) | Error::AcceptFailed(e) | Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
