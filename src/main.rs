//! Entry point for the `termc` binary.
//!
//! Grounded in `crates/sshx/src/main.rs`'s shape: parse args, init logging,
//! run, propagate the exit code. Collapsed from `#[tokio::main] async fn
//! main` to a plain synchronous `fn main`, since the event loop (§4.5) is
//! single-threaded and blocking by design.

use std::os::fd::{AsFd, BorrowedFd};

use anyhow::{Context, Result};
use clap::Parser;

use termc::child::{self, Child};
use termc::cli::Args;
use termc::event_loop::{Host, TerminalGuard};
use termc::listener;
use termc::logging;

fn main() -> Result<()> {
    logging::init();

    let args = Args::parse();
    let shell = args.shell.clone().unwrap_or_else(child::default_shell);

    match run(&args, &shell) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            logging::unexpected_io_error(
                &format!("{err:#}"),
                &std::io::Error::other(err.to_string()),
            );
            std::process::exit(1);
        }
    }
}

fn run(args: &Args, shell: &str) -> Result<i32> {
    child::install_sigchld_handler()?;

    let stdin = std::io::stdin();
    let stdin_fd: BorrowedFd<'_> = stdin.as_fd();

    // The terminal guard captures stdin's current mode and enters raw mode
    // for the duration of the session, restoring it on every exit path via
    // `Drop` (§3, §7).
    let guard = TerminalGuard::enter(stdin_fd).context("failed to enter raw mode")?;

    let child = Child::spawn(shell, guard.snapshot().termios(), guard.snapshot().winsize())
        .context("failed to spawn shell")?;
    let listener = listener::bind(args.port).context("failed to bind viewer listener")?;

    tracing::info!(port = args.port, shell, "termc listening for viewers");

    let mut host = Host::new(args.ring_capacity, child, listener)?;
    let status = host.run()?;

    drop(guard); // restore the terminal before the process exits

    Ok(status.process_exit_code())
}
