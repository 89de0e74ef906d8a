//! C6 — `Proxy`: the public facade. See spec §6.
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::action::Handler;
use crate::config::ProxyConfig;
use crate::endpoint::Endpoint;
use crate::errors::Error;
use crate::event_loop::{self, Command};

/// Owns one dedicated OS thread running the event loop for one
/// downstream-listener/upstream-target pair (spec §6.1–§6.2).
///
/// Dropping a `Proxy` stops it: `Drop` sends `Command::Break` and joins the
/// background thread before returning, the same guarantee
/// `socket_forwarder.py`'s `Proxy.__exit__` gets from calling
/// `self.stop(wait_for=True)` on scoped exit (spec §4.6, §9 — "guaranteed
/// join on all exit paths"). Call [`Proxy::stop`] explicitly first if the
/// fatal error it can return needs to be observed; by the time `drop` runs
/// that error has nowhere left to go but the log.
pub struct Proxy {
    control_tx: mpsc::UnboundedSender<Command>,
    join_handle: Option<std::thread::JoinHandle<Result<(), Error>>>,
    fatal: Arc<Mutex<Option<String>>>,
    bound_addr: Option<SocketAddr>,
}

/// A cheaply-cloneable handle that can request shutdown from another
/// thread without needing `&mut Proxy` (e.g. from a signal handler).
#[derive(Clone)]
pub struct ProxyStopper(mpsc::UnboundedSender<Command>);

impl ProxyStopper {
    pub fn stop(&self) {
        let _ = self.0.send(Command::Break);
    }
}

impl Proxy {
    /// A handle that can be moved to another thread to call [`ProxyStopper::stop`]
    /// while this thread blocks on [`Proxy::wait_for`].
    pub fn stopper(&self) -> ProxyStopper {
        ProxyStopper(self.control_tx.clone())
    }

    /// Starts the proxy: binds `downstream` and begins forwarding accepted
    /// connections to `upstream`, running `handler` on every byte observed
    /// in either direction (spec §6.3). Bind happens on the background
    /// thread; construction blocks only long enough to learn whether that
    /// bind succeeded (so `local_addr()` is immediately usable), not for
    /// the lifetime of the loop.
    pub fn new(upstream: Endpoint, downstream: Endpoint, handler: impl Handler + 'static) -> Self {
        Self::with_config(
            ProxyConfig {
                upstream,
                downstream,
                buffer_size: None,
            },
            handler,
        )
    }

    /// Like [`Proxy::new`], but reads `buffer_size` and other ambient
    /// settings from a [`ProxyConfig`] (see `config.rs`).
    pub fn with_config(config: ProxyConfig, handler: impl Handler + 'static) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let fatal = Arc::new(Mutex::new(None));
        let fatal_for_thread = fatal.clone();
        let handler: Arc<dyn Handler> = Arc::new(handler);

        let join_handle = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build current-thread runtime");
            let local = tokio::task::LocalSet::new();
            let live_sessions = std::rc::Rc::new(std::cell::Cell::new(0u64));
            let session_done = std::rc::Rc::new(tokio::sync::Notify::new());

            let result = local.block_on(&runtime, event_loop::run(
                config.downstream,
                config.upstream,
                handler,
                control_rx,
                config.buffer_size,
                live_sessions,
                session_done,
                ready_tx,
            ));

            if let Err(ref e) = result {
                *fatal_for_thread.lock() = Some(e.to_string());
            }
            result
        });

        // Waits for the bind to complete (or fail) before returning, so
        // callers can rely on `local_addr()` immediately — handy for tests
        // that bind to port 0 and need to know what port was chosen.
        let bound_addr = ready_rx.recv().ok();

        Proxy {
            control_tx,
            join_handle: Some(join_handle),
            fatal,
            bound_addr,
        }
    }

    /// The address the downstream listener actually bound to, once bind has
    /// completed. `None` if bind failed or hasn't completed yet (it always
    /// has by the time `new`/`with_config` returns).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    /// Tells the loop thread to stop accepting and to wind down. When `wait`
    /// is `true`, blocks until the thread has exited (spec §6.4). Breaking
    /// the accept loop does not cancel sessions already in flight: the loop
    /// thread drains them (bounded by `event_loop::SHUTDOWN_DRAIN_TIMEOUT`)
    /// before the thread itself exits, so a session still flushing a
    /// handler-committed reply at the moment of `stop` is not silently
    /// dropped along with the `LocalSet`.
    pub fn stop(&mut self, wait: bool) {
        let _ = self.control_tx.send(Command::Break);
        if wait {
            self.join();
        }
    }

    /// Blocks until the loop thread exits, re-raising any fatal error it
    /// recorded (spec §6.4, §7: `BindFailed`/`Io` are the only variants that
    /// can reach here, since every other kind is handled internally).
    pub fn wait_for(&mut self) -> Result<(), Error> {
        self.join();
        match self.fatal.lock().take() {
            Some(msg) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                msg,
            ))),
            None => Ok(()),
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        let _ = self.control_tx.send(Command::Break);
        self.join();
        if let Some(msg) = self.fatal.lock().take() {
            log::error!("proxy thread exited with a fatal error after drop: {msg}");
        }
    }
}
