//! `IntentTag` — the discriminated label attached to each readiness
//! registration so events dispatch to the right case (spec §4.5, §9).
//!
//! With a raw `mio`-style selector this tag would be the opaque `data`
//! stored at `register`/`modify` time and handed back by `select()`. Here,
//! where each session is its own cooperative task (see `event_loop.rs`),
//! the tag instead labels which branch of that task's `tokio::select!` fired
//! — used for logging and for tests asserting dispatch order.
use crate::session::SessionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentTag {
    AcceptFromDownstream,
    ReadFromUpstream(SessionKey),
    ReadFromDownstream(SessionKey),
    WriteToUpstream(SessionKey),
    WriteToDownstream(SessionKey),
}

impl std::fmt::Display for IntentTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentTag::AcceptFromDownstream => write!(f, "AcceptFromDownstream"),
            IntentTag::ReadFromUpstream(k) => write!(f, "ReadFromUpstream({k})"),
            IntentTag::ReadFromDownstream(k) => write!(f, "ReadFromDownstream({k})"),
            IntentTag::WriteToUpstream(k) => write!(f, "WriteToUpstream({k})"),
            IntentTag::WriteToDownstream(k) => write!(f, "WriteToDownstream({k})"),
        }
    }
}
