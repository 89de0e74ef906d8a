//! A TCP intercepting proxy core with a pluggable byte-stream `Handler`.
//!
//! Accepts connections on a downstream address, opens a matching connection
//! to an upstream address per session, and shuttles bytes between them,
//! giving a user-supplied [`Handler`] a chance to inspect, rewrite, or
//! redirect every chunk observed in either direction. See `SPEC_FULL.md` and
//! `DESIGN.md` in the repository root for the full design.
pub mod action;
pub mod config;
pub mod endpoint;
pub mod errors;
mod event_loop;
mod interpreter;
pub mod intent;
mod readiness;
pub mod session;
pub mod proxy;

pub use action::{Action, AlterDownstream, Handler, Passthrough};
pub use config::ProxyConfig;
pub use endpoint::Endpoint;
pub use errors::Error;
pub use intent::IntentTag;
pub use proxy::{Proxy, ProxyStopper};
pub use session::{Interest, Session, SessionKey, Side};
