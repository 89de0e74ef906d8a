//! C5 — the event loop. See spec §4.5, §9.
//!
//! One `Proxy` owns one dedicated OS thread (see `proxy.rs`). On that
//! thread, `accept_loop` is the top-level dispatcher (the
//! `AcceptFromDownstream` case); each accepted connection becomes its own
//! `tokio::task::spawn_local` task running `run_session`, which is the
//! `ReadFrom*`/`WriteTo*` state machine for exactly one session. Because
//! every task is spawned onto the same `LocalSet` and that `LocalSet` is
//! driven by a single-threaded runtime, sessions never run concurrently
//! with one another in the OS sense — only cooperatively, at `.await`
//! points — which is what spec §5 means by "single-threaded cooperative".
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;

use bytes::Buf;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::action::{Action, Handler};
use crate::endpoint::Endpoint;
use crate::errors::Error;
use crate::interpreter::apply_actions;
use crate::intent::IntentTag;
use crate::session::{Interest, Session, SessionKey, Side};

pub(crate) enum Command {
    Break,
}

const DEFAULT_BUFFER_SIZE: usize = 4096;

/// How long `run` waits for in-flight sessions to drain after `Break` before
/// giving up on them (spec §4.5/§9: "in flight" sessions run to completion,
/// but a `Proxy::stop(true)` caller still needs a bound on how long that
/// takes). Sessions still alive past this point are abandoned when the
/// `LocalSet` that owns their `spawn_local` task is dropped.
const SHUTDOWN_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Runs the accept loop until a `Command::Break` is received on
/// `control_rx`. Returns once the listener is closed and every session
/// accepted before `Break` has either finished or been given up on after
/// `SHUTDOWN_DRAIN_TIMEOUT`. Must run inside a `LocalSet`.
pub(crate) async fn run(
    downstream_addr: Endpoint,
    upstream_addr: Endpoint,
    handler: Arc<dyn Handler>,
    mut control_rx: mpsc::UnboundedReceiver<Command>,
    buffer_size: Option<usize>,
    live_sessions: Rc<std::cell::Cell<u64>>,
    session_done: Rc<tokio::sync::Notify>,
    ready_tx: std::sync::mpsc::SyncSender<std::net::SocketAddr>,
) -> Result<(), Error> {
    let bind_addr = downstream_addr
        .to_socket_addr()
        .await
        .map_err(Error::BindFailed)?;
    let listener = TcpListener::bind(bind_addr).await.map_err(Error::BindFailed)?;
    // Dropping `ready_tx` without sending (the `?` above) tells anyone
    // blocked on the matching receiver that bind failed; the caller learns
    // the actual `Error` from this function's return value instead.
    let _ = ready_tx.send(listener.local_addr().map_err(Error::BindFailed)?);
    log::info!("listening on {downstream_addr}, forwarding to {upstream_addr}");

    let buffer_size = buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
    let mut next_key: SessionKey = 0;

    loop {
        tokio::select! {
            biased;

            cmd = control_rx.recv() => {
                match cmd {
                    Some(Command::Break) | None => {
                        log::debug!("event loop received BREAK, shutting down");
                        break;
                    }
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let key = next_key;
                        next_key += 1;
                        log::trace!("{}", IntentTag::AcceptFromDownstream);
                        log::debug!("session {key}: accepted downstream connection from {peer}");

                        let handler = handler.clone();
                        let upstream_addr = upstream_addr.clone();
                        live_sessions.set(live_sessions.get() + 1);
                        let live_sessions = live_sessions.clone();
                        let session_done = session_done.clone();

                        tokio::task::spawn_local(async move {
                            run_session(key, stream, upstream_addr, handler, buffer_size).await;
                            live_sessions.set(live_sessions.get() - 1);
                            session_done.notify_waiters();
                        });
                    }
                    Err(e) => {
                        // AcceptFailed: logged, loop continues.
                        log::warn!("accept failed: {e}");
                    }
                }
            }
        }
    }

    drain_sessions(&live_sessions, &session_done).await;

    Ok(())
}

/// Waits for every session task spawned before `Break` to finish, bounded by
/// `SHUTDOWN_DRAIN_TIMEOUT`. `session_done` is notified each time a session
/// task decrements `live_sessions`; re-checking the count after registering
/// interest (rather than just looping on `notified().await`) avoids missing
/// a notification that lands between the check and the `await`.
async fn drain_sessions(live_sessions: &Rc<std::cell::Cell<u64>>, session_done: &Rc<tokio::sync::Notify>) {
    if live_sessions.get() == 0 {
        return;
    }
    log::debug!("waiting for {} in-flight session(s) to finish", live_sessions.get());
    let waited = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
        loop {
            if live_sessions.get() == 0 {
                return;
            }
            let notified = session_done.notified();
            if live_sessions.get() == 0 {
                return;
            }
            notified.await;
        }
    })
    .await;
    if waited.is_err() {
        log::warn!(
            "{} session(s) still in flight after {:?}, abandoning them",
            live_sessions.get(),
            SHUTDOWN_DRAIN_TIMEOUT,
        );
    }
}

async fn connect_upstream(addr: &Endpoint) -> Option<TcpStream> {
    let socket_addr = match addr.to_socket_addr().await {
        Ok(a) => a,
        Err(_) => return None,
    };
    TcpStream::connect(socket_addr).await.ok()
}

/// Drives one session's full-duplex forwarding to completion (both sides
/// closed). Owns the two socket halves directly; `Session` carries only the
/// buffers and close flags (spec §3), which is all the action interpreter
/// needs to touch.
async fn run_session(
    key: SessionKey,
    downstream_stream: TcpStream,
    upstream_addr: Endpoint,
    handler: Arc<dyn Handler>,
    buffer_size: usize,
) {
    let mut session = Session::new(key);
    let mut downstream = Some(downstream_stream);
    let mut upstream = connect_upstream(&upstream_addr).await;

    if upstream.is_none() {
        log::warn!("session {key}: upstream connect failed, deferring as broken pipe on first write");
    }

    let mut read_buf = vec![0u8; buffer_size];
    let mut upstream_write_shutdown = false;
    let mut downstream_write_shutdown = false;

    while session.is_live() {
        let downstream_interest = session.interest_for(Side::Downstream);
        let upstream_interest = session.interest_for(Side::Upstream);

        let down_read = matches!(downstream_interest, Some(Interest::Read)) && downstream.is_some();
        let down_write = matches!(downstream_interest, Some(Interest::Write)) && downstream.is_some();
        let up_read = matches!(upstream_interest, Some(Interest::Read)) && upstream.is_some();
        let up_write = matches!(upstream_interest, Some(Interest::Write));

        tokio::select! {
            biased;

            res = ready_on(downstream.as_ref(), Interest::Read), if down_read => {
                log::trace!("{}", IntentTag::ReadFromDownstream(key));
                if res.is_ok() {
                    do_read(&mut session, Side::Downstream, downstream.as_ref().unwrap(), &mut read_buf, &handler);
                }
            }

            res = ready_on(downstream.as_ref(), Interest::Write), if down_write => {
                log::trace!("{}", IntentTag::WriteToDownstream(key));
                if res.is_ok() {
                    do_write(&mut session, Side::Downstream, downstream.as_ref());
                }
            }

            res = ready_on(upstream.as_ref(), Interest::Read), if up_read => {
                log::trace!("{}", IntentTag::ReadFromUpstream(key));
                if res.is_ok() {
                    do_read(&mut session, Side::Upstream, upstream.as_ref().unwrap(), &mut read_buf, &handler);
                }
            }

            res = ready_on(upstream.as_ref(), Interest::Write), if up_write => {
                log::trace!("{}", IntentTag::WriteToUpstream(key));
                if res.is_ok() && upstream.is_some() {
                    do_write(&mut session, Side::Upstream, upstream.as_ref());
                } else {
                    // No real upstream connection (connect failed or already
                    // gone): simulate the send that would have failed.
                    on_broken_pipe(&mut session, Side::Upstream);
                }
            }
        }

        advance_closure(
            &mut session,
            &mut downstream,
            &mut upstream,
            &mut upstream_write_shutdown,
            &mut downstream_write_shutdown,
        )
        .await;
    }

    log::debug!("session {key}: both sides closed");
}

/// Waits for `interest` readiness on `stream`, or never resolves if `stream`
/// is `None` (the caller's `if` guard keeps that branch out of the race in
/// that case; this only runs at all when the guard admitted it).
async fn ready_on(stream: Option<&TcpStream>, interest: Interest) -> std::io::Result<()> {
    match stream {
        Some(s) => crate::readiness::wait_ready(s, interest).await,
        None => std::future::ready(Ok(())).await,
    }
}

fn do_read(
    session: &mut Session,
    side: Side,
    stream: &TcpStream,
    buf: &mut [u8],
    handler: &Arc<dyn Handler>,
) {
    match crate::readiness::try_read(stream, buf) {
        Ok(0) => on_peer_closed(session, side),
        Ok(n) => {
            let data = &buf[..n];
            let actions = invoke_handler(session, side, data, handler);
            match actions {
                Ok(actions) => apply_actions(session, side, data, actions),
                Err(msg) => {
                    log::error!("session {}: handler error: {msg}", session.key);
                    session.upstream_closed = true;
                    session.downstream_closed = true;
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => {
            log::warn!("session {}: read error on {side:?}: {e}", session.key);
            on_read_error(session, side);
        }
    }
}

fn invoke_handler(
    session: &Session,
    side: Side,
    data: &[u8],
    handler: &Arc<dyn Handler>,
) -> Result<Vec<Action>, String> {
    let result = catch_unwind(AssertUnwindSafe(|| match side {
        Side::Downstream => handler.handle_downstream_data(session, data),
        Side::Upstream => handler.handle_upstream_data(session, data),
    }));
    result.map_err(|_| "handler panicked".to_string())
}

fn do_write(session: &mut Session, side: Side, stream: Option<&TcpStream>) {
    let Some(stream) = stream else {
        on_broken_pipe(session, side);
        return;
    };
    let pending = session.write_buf(side).clone();
    match crate::readiness::try_write(stream, &pending) {
        Ok(n) => {
            session.write_buf_mut(side).advance(n);
            if session.write_buf(side).is_empty() {
                on_write_drained(session, side);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(_) => on_broken_pipe(session, side),
    }
}

/// `recv` returned 0 on `side`: mark it at EOF. This does *not* close the
/// socket — `side`'s own write half may still need to deliver bytes the
/// opposite side already queued, or is about to queue once it sees its peer
/// has no more to send. `advance_closure` is what actually shuts sockets
/// down, once both directions agree there is nothing left to do (spec §4.5
/// `ReadFrom*` case, 0-byte branch; §8 scenario 3).
fn on_peer_closed(session: &mut Session, side: Side) {
    session.set_eof(side, true);
}

/// An unexpected (non-WouldBlock, non-zero) read error: unlike a clean EOF,
/// the connection is in an unknown state, so there is nothing to drain —
/// close both sides immediately.
fn on_read_error(session: &mut Session, side: Side) {
    session.set_closed(side, true);
    session.set_closed(side.opposite(), true);
}

/// A write buffer just drained: if the opposite side is already closed,
/// this side is done too; otherwise it reverts to READ on the next pass
/// (handled automatically by `Session::interest_for`).
fn on_write_drained(session: &mut Session, side: Side) {
    if session.closed(side.opposite()) {
        session.set_closed(side, true);
    }
}

/// `send` toward `side` failed (or there was never a real connection to
/// send on, as with a failed upstream connect): close the *opposite* side
/// and drop the bytes that could never be delivered (spec §4.5 `WriteTo*`
/// case, `BrokenPipe` branch; §7).
fn on_broken_pipe(session: &mut Session, side: Side) {
    session.set_closed(side.opposite(), true);
    session.write_buf_mut(side).clear();
    on_write_drained(session, side);
}

/// Pure half-close/teardown decision for the current session state (spec §8
/// scenario 3): once a side has seen EOF and drained whatever it owed the
/// *other* side, that other side's write half can be told "nothing more is
/// coming" — and once both directions have reached that point, the whole
/// session is done. Kept separate from the actual I/O so it can be tested
/// without real sockets.
fn closure_decisions(
    session: &Session,
    upstream_write_shutdown: bool,
    downstream_write_shutdown: bool,
) -> (bool, bool, bool) {
    let shutdown_upstream_write = !upstream_write_shutdown
        && session.eof(Side::Downstream)
        && session.write_buf(Side::Upstream).is_empty();
    let shutdown_downstream_write = !downstream_write_shutdown
        && session.eof(Side::Upstream)
        && session.write_buf(Side::Downstream).is_empty();
    let fully_drained = session.eof(Side::Downstream)
        && session.eof(Side::Upstream)
        && session.write_buf(Side::Downstream).is_empty()
        && session.write_buf(Side::Upstream).is_empty();
    (shutdown_upstream_write, shutdown_downstream_write, fully_drained)
}

/// Applies `closure_decisions`: shuts down whichever write halves are now
/// owed nothing further, tears the session down once both directions are
/// fully drained, and drops any socket whose `_closed` flag is set (by this
/// or by `on_broken_pipe`/`on_read_error`'s immediate-abort paths).
async fn advance_closure(
    session: &mut Session,
    downstream: &mut Option<TcpStream>,
    upstream: &mut Option<TcpStream>,
    upstream_write_shutdown: &mut bool,
    downstream_write_shutdown: &mut bool,
) {
    let (shutdown_upstream, shutdown_downstream, fully_drained) =
        closure_decisions(session, *upstream_write_shutdown, *downstream_write_shutdown);

    if shutdown_upstream {
        if let Some(s) = upstream.as_ref() {
            let _ = s.shutdown().await;
        }
        *upstream_write_shutdown = true;
    }
    if shutdown_downstream {
        if let Some(s) = downstream.as_ref() {
            let _ = s.shutdown().await;
        }
        *downstream_write_shutdown = true;
    }
    if fully_drained {
        session.set_closed(Side::Downstream, true);
        session.set_closed(Side::Upstream, true);
    }

    if session.downstream_closed {
        if let Some(s) = downstream.take() {
            let _ = s.shutdown().await;
        }
    }
    if session.upstream_closed {
        if let Some(s) = upstream.take() {
            let _ = s.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_closed_marks_eof_without_closing_either_side() {
        let mut s = Session::new(0);
        on_peer_closed(&mut s, Side::Downstream);
        assert!(s.downstream_eof);
        assert!(!s.downstream_closed);
        assert!(!s.upstream_closed);
    }

    #[test]
    fn read_error_closes_both_sides_immediately() {
        let mut s = Session::new(0);
        on_read_error(&mut s, Side::Downstream);
        assert!(s.downstream_closed);
        assert!(s.upstream_closed);
    }

    #[test]
    fn closure_decisions_shut_upstream_write_once_downstream_eof_and_drained() {
        let mut s = Session::new(0);
        s.set_eof(Side::Downstream, true);
        let (shut_up, shut_down, done) = closure_decisions(&s, false, false);
        assert!(shut_up);
        assert!(!shut_down);
        assert!(!done);
    }

    #[test]
    fn closure_decisions_wait_for_pending_upstream_buffer() {
        let mut s = Session::new(0);
        s.set_eof(Side::Downstream, true);
        s.to_upstream_buf.extend_from_slice(b"abc");
        let (shut_up, _, done) = closure_decisions(&s, false, false);
        assert!(!shut_up, "must not shut down the write half while bytes are still queued");
        assert!(!done);
    }

    #[test]
    fn closure_decisions_do_not_repeat_an_already_performed_shutdown() {
        let mut s = Session::new(0);
        s.set_eof(Side::Downstream, true);
        let (shut_up, _, _) = closure_decisions(&s, true, false);
        assert!(!shut_up);
    }

    #[test]
    fn closure_decisions_finish_once_both_sides_eof_and_drained() {
        let mut s = Session::new(0);
        s.set_eof(Side::Downstream, true);
        s.set_eof(Side::Upstream, true);
        let (_, _, done) = closure_decisions(&s, false, false);
        assert!(done);
    }

    #[test]
    fn write_drained_closes_this_side_once_opposite_already_closed() {
        let mut s = Session::new(0);
        s.set_closed(Side::Downstream, true);
        on_write_drained(&mut s, Side::Upstream);
        assert!(s.upstream_closed);
    }

    #[test]
    fn write_drained_leaves_side_open_when_opposite_still_open() {
        let mut s = Session::new(0);
        on_write_drained(&mut s, Side::Upstream);
        assert!(!s.upstream_closed);
    }

    #[test]
    fn broken_pipe_writing_to_upstream_closes_downstream_and_drops_buffer() {
        let mut s = Session::new(0);
        s.to_upstream_buf.extend_from_slice(b"lost");
        on_broken_pipe(&mut s, Side::Upstream);
        assert!(s.downstream_closed);
        assert!(s.to_upstream_buf.is_empty());
        // downstream just became closed, and the upstream buffer is now
        // empty, so upstream closes too in the same step.
        assert!(s.upstream_closed);
    }
}
