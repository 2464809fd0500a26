//! Binary entry point.
//!
//! Responder when no remote is given, initiator otherwise.  `--ssh` first
//! launches the responder on the remote host and waits for its READY line.

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bsync::cli::Cli;
use bsync::config::Direction;
use bsync::net::{request_shutdown, shutdown_requested};
use bsync::ssh::RemoteResponder;
use bsync::{client, server};

extern "C" fn on_interrupt(_sig: libc::c_int) {
    // Raise the flag; drivers drain, best-effort emit done, and exit.
    request_shutdown();
}

fn install_interrupt_handler() {
    let handler = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: on_interrupt only touches an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    install_interrupt_handler();

    let cli = Cli::parse();
    let cfg = cli.sync_config();

    // Resolve the remote address, launching it over SSH when asked to.
    let mut remote_proc = None;
    let remote_addr = match (&cli.remote, &cli.ssh) {
        (_, Some(target)) => {
            let responder = RemoteResponder::launch(target, cli.port, cli.block_size)?;
            responder.wait_ready()?;
            let addr = format!("{}:{}", target.host, cli.port);
            remote_proc = Some(responder);
            Some(addr)
        }
        (Some(addr), None) => Some(addr.clone()),
        (None, None) => None,
    };

    match remote_addr {
        Some(remote) => {
            let stats = match cli.direction() {
                Direction::Push => client::push(&cfg, &remote),
                Direction::Pull => client::pull(&cfg, &remote),
            }
            .with_context(|| format!("sync with {remote} failed"))?;

            if let Some(proc) = remote_proc {
                proc.finish();
            }
            if shutdown_requested() {
                bail!("interrupted after {} blocks", stats.blocks);
            }
            info!(
                blocks = stats.blocks,
                diff = stats.diff_blocks,
                wire_bytes = stats.wire_bytes,
                "sync complete"
            );
            Ok(())
        }
        None => {
            let listen = cli.listen.to_string();
            server::serve(&cfg, &listen, cli.port).context("responder failed")?;
            if shutdown_requested() {
                bail!("interrupted");
            }
            Ok(())
        }
    }
}
