//! C2 — `Session`: per-connection state. See spec §3.
use bytes::BytesMut;

pub type SessionKey = u64;

/// Which side of a session a piece of observed data came from / an action
/// targets. Named by the *observation point*, matching the Handler contract
/// (see `action.rs`), not by where the bytes are headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Upstream,
    Downstream,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Upstream => Side::Downstream,
            Side::Downstream => Side::Upstream,
        }
    }
}

/// Readiness interest for one socket of a session, derived from buffer state
/// (spec §3 invariant 3) rather than tracked by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Per-connection state: two write buffers and two close flags. The actual
/// socket halves live with the task driving the session (`event_loop.rs`),
/// not on this struct, so that `AlterSession` (a full-value replace) can be
/// applied to buffers/flags without fighting the borrow checker over live
/// `TcpStream` halves — see DESIGN.md.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: SessionKey,
    pub to_upstream_buf: BytesMut,
    pub to_downstream_buf: BytesMut,
    pub upstream_closed: bool,
    pub downstream_closed: bool,
    /// `recv` returned 0 on this side. Distinct from `_closed`: a side can be
    /// at EOF on read while its socket is still open for writing, so a reply
    /// already in flight from the other side can still be delivered (spec
    /// §8 scenario 3). See `event_loop::advance_closure`.
    pub upstream_eof: bool,
    pub downstream_eof: bool,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        Session {
            key,
            to_upstream_buf: BytesMut::new(),
            to_downstream_buf: BytesMut::new(),
            upstream_closed: false,
            downstream_closed: false,
            upstream_eof: false,
            downstream_eof: false,
        }
    }

    /// A session is live iff at least one side is still open (invariant 1).
    pub fn is_live(&self) -> bool {
        !(self.upstream_closed && self.downstream_closed)
    }

    pub fn closed(&self, side: Side) -> bool {
        match side {
            Side::Upstream => self.upstream_closed,
            Side::Downstream => self.downstream_closed,
        }
    }

    pub fn set_closed(&mut self, side: Side, closed: bool) {
        match side {
            Side::Upstream => self.upstream_closed = closed,
            Side::Downstream => self.downstream_closed = closed,
        }
    }

    pub fn eof(&self, side: Side) -> bool {
        match side {
            Side::Upstream => self.upstream_eof,
            Side::Downstream => self.downstream_eof,
        }
    }

    pub fn set_eof(&mut self, side: Side, eof: bool) {
        match side {
            Side::Upstream => self.upstream_eof = eof,
            Side::Downstream => self.downstream_eof = eof,
        }
    }

    pub fn write_buf(&self, side: Side) -> &BytesMut {
        match side {
            Side::Upstream => &self.to_upstream_buf,
            Side::Downstream => &self.to_downstream_buf,
        }
    }

    pub fn write_buf_mut(&mut self, side: Side) -> &mut BytesMut {
        match side {
            Side::Upstream => &mut self.to_upstream_buf,
            Side::Downstream => &mut self.to_downstream_buf,
        }
    }

    /// Readiness interest for `side`, per spec §3 invariant 3: WRITE iff this
    /// side's own write buffer is non-empty, or the *pair* socket is closed
    /// while this side still has bytes to flush; otherwise READ. Returns
    /// `None` when `side` is already closed (not registered at all, per
    /// invariant 2), or when this side has already seen EOF on read and has
    /// nothing left to flush — there is nothing left to do with it until the
    /// opposite side either feeds its write buffer or the session finalizes.
    pub fn interest_for(&self, side: Side) -> Option<Interest> {
        if self.closed(side) {
            return None;
        }
        if !self.write_buf(side).is_empty() {
            Some(Interest::Write)
        } else if self.eof(side) {
            None
        } else {
            Some(Interest::Read)
        }
    }
}
