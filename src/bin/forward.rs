//! `forward` — the reference CLI for the proxy core (spec §6.5).
//!
//! Usage: `forward <LOCAL_ADDR> <REMOTE_ADDR>`. Listens on `LOCAL_ADDR`,
//! forwards every accepted connection to `REMOTE_ADDR` with a `Passthrough`
//! handler, and runs until Ctrl-C or a fatal proxy error.
use std::process::ExitCode;

use tcpforward::{Endpoint, Passthrough, Proxy};

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let (local, remote) = match (args.next(), args.next()) {
        (Some(l), Some(r)) => (l, r),
        _ => {
            eprintln!("usage: forward <LOCAL_ADDR> <REMOTE_ADDR>");
            return ExitCode::FAILURE;
        }
    };

    let downstream = match Endpoint::parse(&local) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("invalid LOCAL_ADDR: {e}");
            return ExitCode::FAILURE;
        }
    };
    let upstream = match Endpoint::parse(&remote) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("invalid REMOTE_ADDR: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut proxy = Proxy::new(upstream, downstream, Passthrough);
    let stopper = proxy.stopper();

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .expect("failed to build signal-handling runtime");
        runtime.block_on(async {
            let _ = tokio::signal::ctrl_c().await;
        });
        log::info!("received interrupt, stopping");
        stopper.stop();
    });

    match proxy.wait_for() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("forward: {e}");
            ExitCode::FAILURE
        }
    }
}
