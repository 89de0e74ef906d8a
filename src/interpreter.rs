//! C4 — the action interpreter. See spec §4.4.
use crate::action::Action;
use crate::session::{Session, Side};

/// Apply `actions`, observed on `side` and carrying `data`, to `session`.
///
/// Mutates `session`'s buffers (and possibly replaces it wholesale via
/// `AlterSession`) in place. Does not touch sockets or readiness
/// registrations: interest is a pure function of buffer/close state
/// (`Session::interest_for`), so there is nothing else to "request".
///
/// Ordering guarantee: actions are applied in the order given, and bytes
/// appended to a write buffer land at its tail, so FIFO order on the wire is
/// preserved across Actions and across successive read events.
pub fn apply_actions(session: &mut Session, side: Side, data: &[u8], actions: Vec<Action>) {
    // `chosen` starts as "no override" (i.e. forward the observed bytes);
    // the last CopyAsIs/AlterData seen wins, per the tie-break rule.
    let mut chosen: Option<bytes::Bytes> = None;
    let mut explicit_write = false;

    for action in actions {
        match action {
            Action::CopyAsIs => chosen = None,
            Action::AlterData(d) => chosen = Some(d),
            Action::AlterSession(s) => *session = s,
            Action::WriteToUpstream(d) => {
                session.to_upstream_buf.extend_from_slice(&d);
                if side == Side::Downstream {
                    explicit_write = true;
                }
            }
            Action::WriteToDownstream(d) => {
                session.to_downstream_buf.extend_from_slice(&d);
                if side == Side::Upstream {
                    explicit_write = true;
                }
            }
        }
    }

    if !explicit_write {
        let bytes = chosen.as_deref().unwrap_or(data);
        session.write_buf_mut(side.opposite()).extend_from_slice(bytes);
    }
}
