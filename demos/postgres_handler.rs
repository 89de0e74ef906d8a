//! Illustrative `Handler` for the use case that motivates this crate:
//! sitting in front of a PostgreSQL server and observing (or short-circuiting)
//! traffic at the wire-protocol level. Not part of the core library — the
//! core stays protocol-agnostic (see SPEC_FULL.md §1) — but kept here to
//! show what a consumer built on top of it looks like.
//!
//! Startup-message parsing is adapted from
//! `examples/levkk-pgcat/src/messages.rs::parse_startup`; the client/server
//! message-code tables mirror `radium226/pg_proxy/wire.py`'s
//! `ServerResponse`/`client_command` enums.
use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use parking_lot::Mutex;

use tcpforward::{Action, Handler, Session};

/// First byte of a regular (post-startup) client message.
#[allow(dead_code)]
mod client_command {
    pub const BIND: u8 = b'B';
    pub const CLOSE: u8 = b'C';
    pub const DESCRIBE: u8 = b'D';
    pub const EXECUTE: u8 = b'E';
    pub const FLUSH: u8 = b'H';
    pub const QUERY: u8 = b'Q';
    pub const PARSE: u8 = b'P';
    pub const PASSWORD_MESSAGE: u8 = b'p';
    pub const SYNC: u8 = b'S';
    pub const TERMINATE: u8 = b'X';
}

/// A magic out-of-band query this handler intercepts instead of forwarding
/// to the real server, demonstrating `Action::WriteToDownstream` used to
/// answer the client directly (the `custom_protocol_response_ok` pattern in
/// `messages.rs`).
const MAGIC_QUERY: &[u8] = b"SET SHARDING KEY";

/// Parses the very first message on each connection as a PostgreSQL
/// `StartupMessage` and logs the negotiated user/database, then forwards
/// everything else unchanged — except `MAGIC_QUERY`, which it answers
/// locally without ever reaching upstream.
///
/// Per-session "have we seen the startup message yet" state lives outside
/// `Session` (which only carries the fields the core interpreter needs);
/// tracking it here by session key is the same shape pgcat's connection
/// pool uses for per-client bookkeeping that the wire layer itself doesn't
/// need to know about.
#[derive(Default)]
pub struct PostgresHandler {
    seen_startup: Mutex<std::collections::HashSet<u64>>,
}

impl PostgresHandler {
    pub fn new() -> Self {
        PostgresHandler::default()
    }

    fn log_startup_once(&self, session: &Session, data: &[u8]) {
        let mut seen = self.seen_startup.lock();
        if seen.contains(&session.key) {
            return;
        }
        seen.insert(session.key);

        if let Some(params) = parse_startup_message(data) {
            log::info!(
                "session {}: startup user={:?} database={:?}",
                session.key,
                params.get("user"),
                params.get("database"),
            );
        }
    }
}

impl Handler for PostgresHandler {
    fn handle_upstream_data(&self, _session: &Session, _data: &[u8]) -> Vec<Action> {
        vec![Action::CopyAsIs]
    }

    fn handle_downstream_data(&self, session: &Session, data: &[u8]) -> Vec<Action> {
        self.log_startup_once(session, data);

        if data.windows(MAGIC_QUERY.len()).any(|w| w == MAGIC_QUERY) {
            return vec![Action::WriteToDownstream(command_complete_ready("SET"))];
        }

        vec![Action::CopyAsIs]
    }
}

/// Best-effort `StartupMessage` parse: `i32 length, i32 protocol, (cstring
/// name, cstring value)*, 0x00`. Returns `None` for anything that doesn't
/// look like a startup packet (e.g. a regular query on a connection this
/// handler hasn't seen from the start, or an SSLRequest).
fn parse_startup_message(data: &[u8]) -> Option<HashMap<String, String>> {
    let mut buf = Bytes::copy_from_slice(data);
    if buf.remaining() < 8 {
        return None;
    }
    let _len = buf.get_i32();
    let protocol = buf.get_i32();
    if protocol != 196_608 {
        return None;
    }

    let mut fields = Vec::new();
    let mut current = Vec::new();
    while buf.has_remaining() {
        let b = buf.get_u8();
        if b == 0 {
            if current.is_empty() {
                break;
            }
            fields.push(String::from_utf8_lossy(&current).into_owned());
            current.clear();
        } else {
            current.push(b);
        }
    }

    if fields.len() % 2 != 0 {
        return None;
    }
    Some(
        fields
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect(),
    )
}

/// Builds the client's MD5 password-challenge response (`PasswordMessage`),
/// for a handler that wants to complete an `AuthenticationMD5Password`
/// handshake on the client's behalf. Adapted from
/// `messages.rs::md5_password`.
pub fn md5_password_response(user: &str, password: &str, salt: &[u8]) -> Bytes {
    let mut md5 = Md5::new();
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let inner = md5.finalize_reset();

    md5.update(format!("{inner:x}"));
    md5.update(salt);
    let mut password = format!("md5{:x}", md5.finalize()).into_bytes();
    password.push(0);

    let mut message = BytesMut::with_capacity(password.len() + 5);
    message.put_u8(b'p');
    message.put_i32(password.len() as i32 + 4);
    message.put_slice(&password);
    message.freeze()
}

/// `CommandComplete` + `ReadyForQuery(idle)`, matching
/// `messages.rs::custom_protocol_response_ok`.
fn command_complete_ready(tag: &str) -> Bytes {
    let tag = format!("{tag}\0");
    let mut res = BytesMut::with_capacity(tag.len() + 10);

    res.put_u8(b'C');
    res.put_i32((tag.len() + 4) as i32);
    res.put_slice(tag.as_bytes());

    res.put_u8(b'Z');
    res.put_i32(5);
    res.put_u8(b'I');

    res.freeze()
}

/// Run as `postgres_handler <LOCAL_ADDR> <PG_ADDR>` to try it against a real
/// PostgreSQL server.
fn main() {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let (local, remote) = match (args.next(), args.next()) {
        (Some(l), Some(r)) => (l, r),
        _ => {
            eprintln!("usage: postgres_handler <LOCAL_ADDR> <PG_ADDR>");
            std::process::exit(1);
        }
    };
    let downstream = tcpforward::Endpoint::parse(&local).expect("invalid LOCAL_ADDR");
    let upstream = tcpforward::Endpoint::parse(&remote).expect("invalid PG_ADDR");

    let mut proxy = tcpforward::Proxy::new(upstream, downstream, PostgresHandler::new());
    let stopper = proxy.stopper();
    std::thread::spawn(move || ctrlc_then_stop(stopper));
    let _ = proxy.wait_for();
}

fn ctrlc_then_stop(stopper: tcpforward::ProxyStopper) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .expect("failed to build signal-handling runtime");
    runtime.block_on(async {
        let _ = tokio::signal::ctrl_c().await;
    });
    stopper.stop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_startup_message() {
        let mut body = BytesMut::new();
        body.put_i32(196_608);
        body.put_slice(b"user\0alice\0database\0widgets\0\0");
        let mut packet = BytesMut::new();
        packet.put_i32(body.len() as i32 + 4);
        packet.put_slice(&body);

        let parsed = parse_startup_message(&packet).unwrap();
        assert_eq!(parsed.get("user"), Some(&"alice".to_string()));
        assert_eq!(parsed.get("database"), Some(&"widgets".to_string()));
    }

    #[test]
    fn non_startup_data_does_not_parse() {
        assert!(parse_startup_message(b"Q\0\0\0\x06hi\0").is_none());
    }

    #[test]
    fn md5_password_response_has_expected_shape() {
        let resp = md5_password_response("alice", "hunter2", b"salt");
        assert_eq!(resp[0], b'p');
        // "md5" + 32 hex chars + NUL
        assert_eq!(resp.len() as i32, i32::from_be_bytes(resp[1..5].try_into().unwrap()) + 1);
        assert!(resp.ends_with(&[0]));
        assert!(resp[5..8].starts_with(b"md5"));
    }

    #[test]
    fn magic_query_is_answered_locally() {
        let handler = PostgresHandler::new();
        let session = Session::new(0);
        let actions = handler.handle_downstream_data(&session, b"SET SHARDING KEY 3");
        assert!(matches!(&actions[..], [Action::WriteToDownstream(_)]));
    }
}
