//! FD registry and poll-set builder (C4).
//!
//! Grounded in the `PollFd`/`PollFlags`/`PollTimeout` idiom from
//! `other_examples/0e93587f_kaplanelad-shellfirm__shellfirm-src-wrap-unix.rs.rs`
//! (`nix::poll`), generalized from that file's single always-stdin loop into
//! a small fixed table indexed by raw FD value, as §4.4 requires: "lookups
//! and interest-mask updates must not allocate once the server is running."

use std::os::fd::{BorrowedFd, RawFd};

use anyhow::{bail, Result};
use nix::poll::{PollFd, PollFlags};

/// Upper bound on how many FDs the registry can track at once.
///
/// stdin, stdout, the PTY master, the listener, and a generous number of
/// viewers, well above anything a single-threaded terminal-sharing process
/// will ever need (§4.4).
pub const MAX_FDS: usize = 64;

/// What a tracked FD is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The host terminal's stdin, read to forward keystrokes to the shell.
    Stdin,
    /// The host terminal's stdout, written to mirror the shell's output.
    Stdout,
    /// The PTY master half, connected to the child shell.
    PtyMaster,
    /// The TCP listening socket, accepting new viewers.
    Listen,
    /// A connected read-only viewer.
    Viewer,
    /// An unused slot.
    Inactive,
}

#[derive(Clone, Copy)]
struct Entry {
    role: Role,
    interest: PollFlags,
}

const EMPTY_ENTRY: Entry = Entry {
    role: Role::Inactive,
    interest: PollFlags::empty(),
};

/// A range-checked table mapping raw FD values to their [`Role`] and current
/// poll interest, doubling as the source of the `PollFd` slice passed to
/// `nix::poll::poll` each iteration (§4.4, §4.5).
pub struct FdRegistry {
    entries: [Entry; MAX_FDS],
}

impl Default for FdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FdRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        FdRegistry {
            entries: [EMPTY_ENTRY; MAX_FDS],
        }
    }

    /// Registers `fd` under `role` with the given initial poll interest.
    ///
    /// Fails if `fd` is negative, exceeds [`MAX_FDS`], or is already
    /// registered (§4.4: every FD the event loop touches is either
    /// `Inactive` or uniquely owned by one role).
    pub fn register(&mut self, fd: RawFd, role: Role, interest: PollFlags) -> Result<()> {
        let idx = self.index_of(fd)?;
        if self.entries[idx].role != Role::Inactive {
            bail!("fd {fd} is already registered as {:?}", self.entries[idx].role);
        }
        self.entries[idx] = Entry { role, interest };
        Ok(())
    }

    /// Deregisters `fd`, marking its slot `Inactive`.
    pub fn deregister(&mut self, fd: RawFd) -> Result<()> {
        let idx = self.index_of(fd)?;
        self.entries[idx] = EMPTY_ENTRY;
        Ok(())
    }

    /// Returns the role `fd` is registered under, if any.
    pub fn role_of(&self, fd: RawFd) -> Option<Role> {
        let idx = self.index_of(fd).ok()?;
        match self.entries[idx].role {
            Role::Inactive => None,
            role => Some(role),
        }
    }

    /// Replaces the poll interest for an already-registered `fd` (§4.5:
    /// e.g. dropping `POLLOUT` on stdout once the ring is caught up, or
    /// adding it back once there is backlog to drain).
    pub fn set_interest(&mut self, fd: RawFd, interest: PollFlags) -> Result<()> {
        let idx = self.index_of(fd)?;
        if self.entries[idx].role == Role::Inactive {
            bail!("fd {fd} is not registered");
        }
        self.entries[idx].interest = interest;
        Ok(())
    }

    /// Returns every currently-registered FD paired with its role, for
    /// building the `PollFd` slice this iteration.
    pub fn iter_active(&self) -> impl Iterator<Item = (RawFd, Role, PollFlags)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.role != Role::Inactive)
            .map(|(fd, e)| (fd as RawFd, e.role, e.interest))
    }

    /// Builds the `PollFd` array for this iteration's `nix::poll::poll` call.
    ///
    /// Borrows `fd` for each active entry from the borrowed-fd table the
    /// caller supplies, since `PollFd` requires a `BorrowedFd` and this
    /// registry only stores raw values (owned fds live in [`crate::child`],
    /// [`crate::listener`], and the main-loop viewer list).
    pub fn build_poll_fds<'a>(
        &self,
        borrow: impl Fn(RawFd) -> Option<BorrowedFd<'a>>,
    ) -> Vec<PollFd<'a>> {
        self.iter_active()
            .filter_map(|(fd, _, interest)| borrow(fd).map(|bfd| PollFd::new(bfd, interest)))
            .collect()
    }

    fn index_of(&self, fd: RawFd) -> Result<usize> {
        if fd < 0 || fd as usize >= MAX_FDS {
            bail!("fd {fd} is out of registry range (0..{MAX_FDS})");
        }
        Ok(fd as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_role_of_round_trips() {
        let mut reg = FdRegistry::new();
        reg.register(3, Role::PtyMaster, PollFlags::POLLIN).unwrap();
        assert_eq!(reg.role_of(3), Some(Role::PtyMaster));
        assert_eq!(reg.role_of(4), None);
    }

    #[test]
    fn double_register_is_rejected() {
        let mut reg = FdRegistry::new();
        reg.register(3, Role::Viewer, PollFlags::POLLIN).unwrap();
        assert!(reg.register(3, Role::Viewer, PollFlags::POLLIN).is_err());
    }

    #[test]
    fn deregister_frees_the_slot() {
        let mut reg = FdRegistry::new();
        reg.register(5, Role::Viewer, PollFlags::POLLIN).unwrap();
        reg.deregister(5).unwrap();
        assert_eq!(reg.role_of(5), None);
        // The slot can be reused for an unrelated role.
        reg.register(5, Role::Stdin, PollFlags::POLLIN).unwrap();
        assert_eq!(reg.role_of(5), Some(Role::Stdin));
    }

    #[test]
    fn out_of_range_fd_is_rejected() {
        let mut reg = FdRegistry::new();
        assert!(reg.register(-1, Role::Stdin, PollFlags::POLLIN).is_err());
        assert!(reg
            .register(MAX_FDS as RawFd, Role::Stdin, PollFlags::POLLIN)
            .is_err());
    }

    #[test]
    fn set_interest_updates_existing_entry() {
        let mut reg = FdRegistry::new();
        reg.register(6, Role::Stdout, PollFlags::empty()).unwrap();
        reg.set_interest(6, PollFlags::POLLOUT).unwrap();
        let (_, _, interest) = reg.iter_active().find(|(fd, ..)| *fd == 6).unwrap();
        assert_eq!(interest, PollFlags::POLLOUT);
    }

    #[test]
    fn set_interest_on_inactive_fd_fails() {
        let mut reg = FdRegistry::new();
        assert!(reg.set_interest(7, PollFlags::POLLIN).is_err());
    }

    #[test]
    fn iter_active_skips_inactive_slots() {
        let mut reg = FdRegistry::new();
        reg.register(0, Role::Stdin, PollFlags::POLLIN).unwrap();
        reg.register(2, Role::PtyMaster, PollFlags::POLLIN).unwrap();
        let fds: Vec<RawFd> = reg.iter_active().map(|(fd, ..)| fd).collect();
        assert_eq!(fds, vec![0, 2]);
    }
}
