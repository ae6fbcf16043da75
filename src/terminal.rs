//! Terminal controller (C1): capture/restore of the host terminal's mode,
//! and the raw-mode transition the hosted shell needs.
//!
//! Grounded in `crates/sshx/src/terminal/unix.rs`'s use of `nix` for
//! termios/ioctl access, generalized from a single winsize query to the
//! full capture/verify/restore lifecycle that `spec.md` §4.1 and §9
//! describe (the teacher never enters raw mode on its own host terminal,
//! since its user types into a browser tab, not this process's stdin; this
//! spec is the first user of the `"term"` feature the teacher's `nix`
//! dependency already lists).

use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use anyhow::{Context, Result};
use nix::libc::{TIOCGWINSZ, TIOCSWINSZ};
use nix::pty::Winsize;
use nix::sys::termios::{self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, Termios};

use crate::logging;

nix::ioctl_read_bad!(ioctl_get_winsize, TIOCGWINSZ, Winsize);
nix::ioctl_write_ptr_bad!(ioctl_set_winsize, TIOCSWINSZ, Winsize);

/// Number of times `apply()` retries `tcsetattr` before giving up.
///
/// `man termios(3)`: "tcsetattr() returns success if any of the requested
/// changes could be successfully carried out." Carried over from
/// `original_source/termc.c`'s `term_set_termios`, which loops the same 32
/// times.
const MAX_APPLY_RETRIES: usize = 32;

/// An immutable snapshot of the host terminal's mode, taken once at startup.
///
/// Consumed exactly once, at teardown, to restore the terminal regardless of
/// how the process exits (§3, §7).
#[derive(Clone)]
pub struct TerminalSnapshot {
    termios: Termios,
    winsize: Winsize,
}

impl TerminalSnapshot {
    /// Returns the captured `winsize`, e.g. to apply to a freshly-created
    /// PTY slave before the child shell execs (§4.2).
    pub fn winsize(&self) -> Winsize {
        self.winsize
    }

    /// Returns the captured termios, e.g. to apply to a PTY slave.
    pub fn termios(&self) -> &Termios {
        &self.termios
    }
}

/// Captures the host terminal's current mode.
///
/// Fails fatally (the caller is expected to abort startup) if `fd` has no
/// controlling terminal, per §4.1.
pub fn capture(fd: BorrowedFd<'_>) -> Result<TerminalSnapshot> {
    let termios = termios::tcgetattr(fd).context("tcgetattr on host terminal")?;
    let winsize = get_winsize(fd)?;
    Ok(TerminalSnapshot { termios, winsize })
}

/// Writes `termios` to `fd`, verifying the kernel actually applied every
/// flag word and the special-character array, retrying up to
/// [`MAX_APPLY_RETRIES`] times (§4.1).
pub fn apply_termios(fd: BorrowedFd<'_>, termios: &Termios) -> Result<()> {
    for _ in 0..MAX_APPLY_RETRIES {
        termios::tcsetattr(fd, SetArg::TCSANOW, termios).context("tcsetattr")?;
        let actual = termios::tcgetattr(fd).context("tcgetattr (verification read)")?;
        if termios_equal(&actual, termios) {
            return Ok(());
        }
    }
    anyhow::bail!(
        "tcsetattr did not converge to the expected mode after {MAX_APPLY_RETRIES} attempts \
         (platform defect)"
    );
}

/// Applies `winsize` to `fd`. An `unsupported ioctl` error is downgraded to
/// a warning; every other failure is fatal (§4.1, following the
/// `EINVAL`-only downgrade in `original_source/termc.c`'s `term_set_sz`).
pub fn apply_winsize(fd: BorrowedFd<'_>, winsize: &Winsize) -> Result<()> {
    match unsafe { ioctl_set_winsize(fd.as_raw_fd(), winsize) } {
        Ok(_) => Ok(()),
        Err(nix::errno::Errno::EINVAL) => {
            logging::warning("failed to set terminal window size: unsupported ioctl TIOCSWINSZ");
            Ok(())
        }
        Err(errno) => Err(anyhow::anyhow!(errno)).context("ioctl TIOCSWINSZ"),
    }
}

fn get_winsize(fd: BorrowedFd<'_>) -> Result<Winsize> {
    const DEFAULT_COLS: u16 = 80;
    const DEFAULT_ROWS: u16 = 24;

    let mut winsize = Winsize {
        ws_row: DEFAULT_ROWS,
        ws_col: DEFAULT_COLS,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    match unsafe { ioctl_get_winsize(fd.as_raw_fd(), &mut winsize) } {
        Ok(_) => Ok(winsize),
        Err(nix::errno::Errno::EINVAL) => {
            logging::warning("failed to get terminal window size: unsupported ioctl TIOCGWINSZ");
            Ok(winsize)
        }
        Err(errno @ (nix::errno::Errno::EBADF | nix::errno::Errno::EFAULT)) => {
            Err(anyhow::anyhow!(errno)).context("ioctl TIOCGWINSZ")
        }
        Err(errno) => Err(anyhow::anyhow!(errno)).context("ioctl TIOCGWINSZ (unexpected errno)"),
    }
}

/// Derives a raw-mode termios from `snapshot` and applies it to `fd`.
///
/// The flags cleared/set are exactly those in `original_source/termc.c`'s
/// `term_set_raw`, not `nix::sys::termios::cfmakeraw`'s generic recipe,
/// since this spec's notion of "raw" is defined by what the reference
/// program does.
pub fn enter_raw(fd: BorrowedFd<'_>, snapshot: &TerminalSnapshot) -> Result<()> {
    let mut raw = snapshot.termios.clone();
    raw.input_flags.remove(
        InputFlags::IGNBRK
            | InputFlags::BRKINT
            | InputFlags::PARMRK
            | InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON,
    );
    raw.output_flags.remove(OutputFlags::OPOST);
    raw.local_flags.remove(
        LocalFlags::ECHO
            | LocalFlags::ECHONL
            | LocalFlags::ICANON
            | LocalFlags::ISIG
            | LocalFlags::IEXTEN,
    );
    raw.control_flags
        .remove(ControlFlags::CSIZE | ControlFlags::PARENB);
    raw.control_flags.insert(ControlFlags::CS8);

    apply_termios(fd, &raw)
}

fn termios_equal(a: &Termios, b: &Termios) -> bool {
    a.input_flags == b.input_flags
        && a.output_flags == b.output_flags
        && a.control_flags == b.control_flags
        && a.local_flags == b.local_flags
        && a.control_chars == b.control_chars
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;

    #[test]
    fn capture_enter_raw_restore_round_trip() -> Result<()> {
        let pty = openpty(None, None)?;
        let fd = pty.slave.as_fd();

        let snapshot = capture(fd)?;
        enter_raw(fd, &snapshot)?;

        // The raw termios must actually differ from the original (ICANON
        // cleared at minimum), otherwise this test would be vacuous.
        let raw_now = termios::tcgetattr(fd)?;
        assert!(!raw_now.local_flags.contains(LocalFlags::ICANON));
        assert!(!raw_now.local_flags.contains(LocalFlags::ECHO));

        apply_termios(fd, &snapshot.termios)?;
        let restored = termios::tcgetattr(fd)?;
        assert!(termios_equal(&restored, &snapshot.termios));
        Ok(())
    }

    #[test]
    fn winsize_round_trip() -> Result<()> {
        let pty = openpty(None, None)?;
        let fd = pty.slave.as_fd();

        let winsize = Winsize {
            ws_row: 50,
            ws_col: 120,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        apply_winsize(fd, &winsize)?;
        let read_back = get_winsize(fd)?;
        assert_eq!(read_back.ws_row, 50);
        assert_eq!(read_back.ws_col, 120);
        Ok(())
    }
}
