//! Child supervisor (C2): forks the shell under the PTY slave and tracks its
//! exit via `SIGCHLD`.
//!
//! Grounded in `crates/sshx/src/terminal/unix.rs`'s `Terminal::new`/
//! `fork_child`/`execv_child`, stripped of its `tokio::fs::File` plumbing
//! (this event loop drives the PTY master with `nix::poll` directly, not an
//! async reactor) and its `PinnedDrop`-triggered `SIGKILL` (§4.2/§4.6: this
//! spec waits for the shell to exit on its own, or be killed by its own
//! session, rather than killing it the instant the `Child` value drops).
//! Exit status surfaces through [`ExitStatus`], read from an
//! async-signal-safe atomic latch a `SIGCHLD` handler fills in (§4.2,
//! following `man signal-safety(7)`).

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{Context, Result};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::termios::Termios;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use std::ffi::CString;
use tracing::trace;

/// Returns the user's preferred shell, falling back to the first of a few
/// common paths that exists on this system (§6: `--shell` takes priority
/// over this when given). Grounded in `crates/sshx/src/terminal/unix.rs`'s
/// `get_default_shell`, made synchronous since this crate has no async
/// runtime.
pub fn default_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    for shell in ["/bin/bash", "/bin/sh", "/usr/local/bin/bash", "/usr/local/bin/sh"] {
        if std::fs::metadata(shell).is_ok() {
            return shell.to_string();
        }
    }
    String::from("sh")
}

/// Sentinel stored in the atomic latch while the child is still running.
const NO_EXIT_YET: i32 = i32::MIN;

/// Shell exit status, as observed by the `SIGCHLD` handler (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The shell exited normally with this code.
    Exited(i32),
    /// The shell was terminated by this signal.
    Signaled(i32),
}

impl ExitStatus {
    /// The process exit code `termc` itself should use (§6, §4.7): the
    /// child's own exit code, or `1` for a signal-terminated shell, matching
    /// `original_source/termc.c:230`'s `exit_status = 1` on `WIFSIGNALED`.
    pub fn process_exit_code(self) -> i32 {
        match self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(_signal) => 1,
        }
    }
}

static LATCHED_STATUS: AtomicI32 = AtomicI32::new(NO_EXIT_YET);
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_sigchld(_: i32) {
    let pid = CHILD_PID.load(Ordering::Relaxed);
    if pid == 0 {
        return;
    }
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => {
            LATCHED_STATUS.store(encode(false, code), Ordering::Relaxed);
        }
        Ok(WaitStatus::Signaled(_, signal, _)) => {
            LATCHED_STATUS.store(encode(true, signal as i32), Ordering::Relaxed);
        }
        // Stopped/Continued/StillAlive: nothing to latch yet.
        _ => {}
    }
}

fn encode(signaled: bool, value: i32) -> i32 {
    // Packs a sign bit and the value into one atomic without allocating:
    // async-signal-safety rules out anything fancier (man signal-safety(7)).
    if signaled {
        -(value + 1)
    } else {
        value.max(0)
    }
}

fn decode(packed: i32) -> ExitStatus {
    if packed < 0 {
        ExitStatus::Signaled(-packed - 1)
    } else {
        ExitStatus::Exited(packed)
    }
}

/// Installs the process-wide `SIGCHLD` handler. Must run once, before
/// [`Child::spawn`] (§4.2).
pub fn install_sigchld_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_sigchld),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // Safety: `handle_sigchld` only touches an atomic and calls
    // `waitpid(WNOHANG)`, both async-signal-safe.
    unsafe { signal::sigaction(Signal::SIGCHLD, &action) }.context("sigaction(SIGCHLD)")?;
    Ok(())
}

/// A running child shell and the PTY master connected to it.
pub struct Child {
    pid: Pid,
    master: OwnedFd,
}

impl Child {
    /// Opens a new PTY, forks, and execs `shell` in the child with the slave
    /// as its controlling terminal, after applying `termios`/`winsize` to it
    /// (§4.2: the slave must already be in the mode the parent wants before
    /// the shell starts reading from it, so readline and job control see a
    /// sane terminal at startup).
    pub fn spawn(shell: &str, termios: &Termios, winsize: Winsize) -> Result<Self> {
        let OpenptyResult { master, slave } = openpty(Some(&winsize), Some(termios))?;

        let shell = CString::new(shell).context("shell path contains a NUL byte")?;

        // SIGCHLD is blocked across the fork so a child that exits before
        // `CHILD_PID` is stored below doesn't deliver its signal into a
        // handler that still reads `pid == 0` and silently drops it; the
        // pending signal replays once unblocked after the store (§4.2).
        let mut sigchld_only = SigSet::empty();
        sigchld_only.add(Signal::SIGCHLD);
        signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&sigchld_only), None)
            .context("block SIGCHLD around fork")?;

        // Safety: the child branch below only calls async-signal-safe
        // functions (no allocation) before execvp.
        let pid = match unsafe { fork() }.context("fork")? {
            ForkResult::Parent { child } => child,
            ForkResult::Child => {
                drop(master);
                // The shell must not inherit a blocked SIGCHLD.
                let _ = signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&sigchld_only), None);
                match exec_child(&shell, slave.as_raw_fd()) {
                    Ok(never) => match never {},
                    Err(_) => std::process::exit(127),
                }
            }
        };
        drop(slave);

        CHILD_PID.store(pid.as_raw(), Ordering::Relaxed);
        signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&sigchld_only), None)
            .context("unblock SIGCHLD after fork")?;
        trace!(pid = pid.as_raw(), "spawned child shell");

        Ok(Child { pid, master })
    }

    /// The PTY master, read/written by the event loop.
    pub fn master(&self) -> &OwnedFd {
        &self.master
    }

    /// The child's pid, e.g. to forward a window-size change via `ioctl` on
    /// the master (no signal needs to be sent for that, unlike `SIGWINCH`
    /// delivery to a foreground process group elsewhere).
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Non-blockingly checks whether the `SIGCHLD` handler has latched an
    /// exit status for this child yet.
    pub fn poll_exit(&self) -> Option<ExitStatus> {
        let packed = LATCHED_STATUS.load(Ordering::Relaxed);
        if packed == NO_EXIT_YET {
            None
        } else {
            Some(decode(packed))
        }
    }
}

fn exec_child(
    shell: &std::ffi::CStr,
    slave_fd: RawFd,
) -> Result<std::convert::Infallible, nix::errno::Errno> {
    // Safety: `slave_fd` was created by `openpty` and is valid in this
    // process; this runs before any other thread could touch it.
    nix::errno::Errno::result(unsafe { nix::libc::login_tty(slave_fd) })?;

    // Safety: called immediately before execvp, no other threads exist in
    // this freshly-forked child to race with the fd table. Closing
    // everything above stdin/stdout/stderr keeps the listener socket and
    // any connected viewer sockets from leaking into the shell (§4.2).
    unsafe { close_fds::CloseFdsBuilder::new().closefrom(3) };

    execvp(shell, &[shell])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shell_is_never_empty() {
        assert!(!default_shell().is_empty());
    }

    #[test]
    fn exit_status_process_exit_code_matches_shell_convention() {
        assert_eq!(ExitStatus::Exited(0).process_exit_code(), 0);
        assert_eq!(ExitStatus::Exited(42).process_exit_code(), 42);
        assert_eq!(ExitStatus::Signaled(9).process_exit_code(), 1);
    }

    #[test]
    fn encode_decode_round_trips_exited() {
        assert_eq!(decode(encode(false, 0)), ExitStatus::Exited(0));
        assert_eq!(decode(encode(false, 17)), ExitStatus::Exited(17));
    }

    #[test]
    fn encode_decode_round_trips_signaled() {
        assert_eq!(decode(encode(true, 9)), ExitStatus::Signaled(9));
        assert_eq!(decode(encode(true, 0)), ExitStatus::Signaled(0));
    }

    #[test]
    fn spawn_true_exits_zero() -> Result<()> {
        use nix::sys::termios::tcgetattr;

        install_sigchld_handler()?;
        let snapshot_termios = {
            let pty = openpty(None, None)?;
            tcgetattr(&pty.slave)?
        };
        let winsize = Winsize {
            ws_row: 24,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let child = Child::spawn("/usr/bin/true", &snapshot_termios, winsize)?;

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if let Some(status) = child.poll_exit() {
                assert_eq!(status, ExitStatus::Exited(0));
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("child did not exit in time");
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        Ok(())
    }
}
