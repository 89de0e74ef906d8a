//! C3 — the Handler contract. See spec §4.3.
use bytes::Bytes;

use crate::session::Session;

/// A directive produced by a [`Handler`] callback. The action interpreter
/// (`interpreter.rs`) applies an ordered list of these to a `Session`.
#[derive(Debug, Clone)]
pub enum Action {
    /// Forward the observed bytes unchanged toward the opposite side.
    CopyAsIs,
    /// Forward `data` instead of the observed bytes toward the opposite side.
    AlterData(Bytes),
    /// Replace the current `Session` value wholesale (field mutations sugar).
    AlterSession(Session),
    /// Append `data` to the upstream write buffer.
    WriteToUpstream(Bytes),
    /// Append `data` to the downstream write buffer.
    WriteToDownstream(Bytes),
}

/// A user-supplied byte-stream interceptor. Both callbacks are pure with
/// respect to sockets: no I/O, no blocking beyond microseconds (the loop
/// that calls them is single-threaded and cooperative).
pub trait Handler: Send + Sync {
    /// Called when bytes arrive FROM upstream, before the loop decides what
    /// to send downstream.
    fn handle_upstream_data(&self, session: &Session, data: &[u8]) -> Vec<Action>;

    /// Called when bytes arrive FROM the downstream client, before the loop
    /// decides what to send upstream.
    fn handle_downstream_data(&self, session: &Session, data: &[u8]) -> Vec<Action>;
}

/// Always forwards bytes unchanged in both directions.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Handler for Passthrough {
    fn handle_upstream_data(&self, _session: &Session, _data: &[u8]) -> Vec<Action> {
        vec![Action::CopyAsIs]
    }

    fn handle_downstream_data(&self, _session: &Session, _data: &[u8]) -> Vec<Action> {
        vec![Action::CopyAsIs]
    }
}

/// Rewrites the client→server (downstream-observed) direction through `f`;
/// upstream→client traffic passes through unchanged.
pub struct AlterDownstream<F>(pub F)
where
    F: Fn(&[u8]) -> Bytes + Send + Sync;

impl<F> Handler for AlterDownstream<F>
where
    F: Fn(&[u8]) -> Bytes + Send + Sync,
{
    fn handle_upstream_data(&self, _session: &Session, _data: &[u8]) -> Vec<Action> {
        vec![Action::CopyAsIs]
    }

    fn handle_downstream_data(&self, _session: &Session, data: &[u8]) -> Vec<Action> {
        vec![Action::AlterData((self.0)(data))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_always_copies() {
        let h = Passthrough;
        let s = Session::new(0);
        assert!(matches!(
            h.handle_upstream_data(&s, b"x")[..],
            [Action::CopyAsIs]
        ));
        assert!(matches!(
            h.handle_downstream_data(&s, b"x")[..],
            [Action::CopyAsIs]
        ));
    }

    #[test]
    fn alter_downstream_rewrites_only_client_to_server_direction() {
        let h = AlterDownstream(|data: &[u8]| {
            Bytes::from(String::from_utf8_lossy(data).to_uppercase().into_bytes())
        });
        let s = Session::new(0);
        match &h.handle_downstream_data(&s, b"hello")[..] {
            [Action::AlterData(d)] => assert_eq!(&d[..], b"HELLO"),
            other => panic!("unexpected actions: {other:?}"),
        }
        assert!(matches!(
            h.handle_upstream_data(&s, b"hello")[..],
            [Action::CopyAsIs]
        ));
    }
}
