//! C7 — readiness abstraction. See spec §4.2.
//!
//! A hand-rolled selector would wrap `mio::Poll` and expose
//! `register`/`modify`/`unregister`/`select`. Tokio's reactor *is* that
//! multiplexer here, and it exposes the same primitive one level up:
//! `TcpStream::readable()`/`writable()` are the "am I registered and ready"
//! wait points, and `try_read`/`try_write` are the non-blocking ops that
//! never suspend the task. This module is the thin wrapper spec §4.2 calls
//! for; it does not reimplement what Tokio already gives us cheaply.
use std::io;

use tokio::net::TcpStream;

use crate::session::Interest;

/// Wait for `interest` on `stream`. The returned future resolves once the
/// socket is registered and ready; it is the loop's "block on select()"
/// step, scoped to a single socket and a single interest.
pub async fn wait_ready(stream: &TcpStream, interest: Interest) -> io::Result<()> {
    match interest {
        Interest::Read => stream.readable().await,
        Interest::Write => stream.writable().await,
    }
}

/// Non-blocking read into `buf`. `Ok(0)` means the peer closed its write
/// half (spec's `PeerClosed`); `Err(WouldBlock)` means the readiness
/// notification was stale and the caller should re-register and wait again.
pub fn try_read(stream: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    stream.try_read(buf)
}

/// Non-blocking write. Returns the number of bytes actually accepted by the
/// OS; callers must re-drive with the remainder (spec §4.5 `WriteTo*` case).
pub fn try_write(stream: &TcpStream, buf: &[u8]) -> io::Result<usize> {
    stream.try_write(buf)
}
