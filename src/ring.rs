//! Ring broadcaster (C3): a bounded, multi-reader, single-writer byte ring.
//!
//! `crates/sshx-server/src/session.rs` keeps an unbounded, append-only
//! `Vec<(u64, String)>` per shell (`State::data`) with a sequence number
//! instead. This spec requires a fixed-capacity ring with true backpressure
//! (§3, §4.3), so the structure itself is new. Its vocabulary, per-consumer
//! sequence tracking, "how far behind is this reader" accounting, and
//! `anyhow`-flavored errors follow `session.rs`'s `Session`/`State` naming
//! and the `anyhow::{bail, Context}` style used throughout the teacher.

use std::os::fd::{AsRawFd, BorrowedFd};

use anyhow::{Context, Result};
use nix::sys::socket::{send, MsgFlags};
use nix::unistd;

/// Default ring capacity (§3): 64 KiB.
pub const DEFAULT_CAPACITY: usize = 1 << 16;

/// A cursor into the ring, owned by whichever consumer it was created for.
///
/// Opaque outside of this module: callers pass it back into [`Ring`] methods
/// rather than inspecting or mutating it directly, so the ring can keep its
/// reader-count invariants (§3) intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    read_idx: usize,
}

/// Destination for bytes drained from the ring (§4.3: "mode selection is a
/// transport detail").
pub enum Sink<'a> {
    /// Local stdout: a plain, blocking `write(2)`.
    File(BorrowedFd<'a>),
    /// A remote viewer socket: `send(2)` with `MSG_NOSIGNAL` so a dead
    /// viewer cannot raise `SIGPIPE` in this single-threaded process.
    Socket(BorrowedFd<'a>),
}

impl Sink<'_> {
    fn emit(&self, buf: &[u8]) -> nix::Result<usize> {
        match self {
            Sink::File(fd) => unistd::write(*fd, buf),
            Sink::Socket(fd) => send(fd.as_raw_fd(), buf, MsgFlags::MSG_NOSIGNAL),
        }
    }
}

/// A fixed-capacity circular byte buffer with per-consumer read cursors.
///
/// Invariants (§3, §8), maintained by construction:
/// - every attached consumer holds exactly one pin, a `+1` in `readers` at
///   the slot equal to its current cursor;
/// - `write_idx` is never advanced past a slot with a non-zero reader count;
/// - the sum of `readers` equals the number of attached consumers, always.
pub struct Ring {
    buf: Box<[u8]>,
    capacity: usize,
    write_idx: usize,
    readers: Box<[u16]>,
}

impl Ring {
    /// Creates an empty ring with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        Ring {
            buf: vec![0u8; capacity].into_boxed_slice(),
            capacity,
            write_idx: 0,
            readers: vec![0u16; capacity].into_boxed_slice(),
        }
    }

    /// Attaches a new consumer, pinning slot 0 and starting its cursor at
    /// the current write frontier so it only ever sees bytes produced from
    /// this moment on (§4.5, "Mirror to one viewer").
    pub fn attach(&mut self) -> Cursor {
        let read_idx = self.write_idx;
        self.readers[read_idx] += 1;
        Cursor { read_idx }
    }

    /// Detaches a consumer, unpinning its current slot. Per §4.3/§4.5, this
    /// immediately makes the writer's next headroom check reflect the
    /// consumer's absence.
    pub fn detach(&mut self, cursor: Cursor) {
        debug_assert!(self.readers[cursor.read_idx] > 0);
        self.readers[cursor.read_idx] = self.readers[cursor.read_idx].saturating_sub(1);
    }

    /// Number of bytes the writer may deposit before it would pass a pinned
    /// slot (§4.3). Walks forward from `write_idx` (exclusive) to the
    /// nearest pin; `capacity` if there is no pin anywhere, `capacity - 1`
    /// if the only pin is a consumer caught up exactly at `write_idx`
    /// (§8's "one slot reserved as the stop marker on wrap").
    pub fn headroom(&self) -> usize {
        for dist in 1..=self.capacity {
            let slot = (self.write_idx + dist) % self.capacity;
            if self.readers[slot] > 0 {
                return dist - 1;
            }
        }
        self.capacity
    }

    /// Deposits `bytes` into the ring and advances `write_idx`.
    ///
    /// The caller must pre-clamp `bytes.len()` to at most [`Ring::headroom`]
    /// (§4.3); this is enforced with a debug assertion rather than a
    /// recomputation, since the event loop (§4.5) always computes headroom
    /// immediately before reading exactly that many bytes from the PTY.
    pub fn write(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.headroom());
        let mut offset = 0;
        while offset < bytes.len() {
            let slot = (self.write_idx + offset) % self.capacity;
            let run = (bytes.len() - offset).min(self.capacity - slot);
            self.buf[slot..slot + run].copy_from_slice(&bytes[offset..offset + run]);
            offset += run;
        }
        self.write_idx = (self.write_idx + bytes.len()) % self.capacity;
    }

    /// Drains bytes from `cursor`'s position toward `write_idx` into `sink`,
    /// emitting at most two contiguous chunks to handle wrap-around (§4.3).
    ///
    /// Returns the number of bytes emitted: `0` if the consumer was already
    /// caught up (idempotent on an empty range, §8), otherwise the count
    /// actually transferred, which may be less than the full backlog if the
    /// second (wrapped) chunk would block.
    pub fn copy_to(&mut self, cursor: &mut Cursor, sink: &Sink<'_>) -> Result<usize> {
        if cursor.read_idx == self.write_idx {
            return Ok(0);
        }

        let available = self.distance(cursor.read_idx, self.write_idx);
        let first_run = available.min(self.capacity - cursor.read_idx);

        let first_emitted = emit_chunk(sink, &self.buf[cursor.read_idx..cursor.read_idx + first_run])
            .context("copy_to: first emission")?;

        let mut total = first_emitted;
        if first_emitted == first_run && first_emitted < available {
            // Wrapped: there is a second, from-the-start chunk to emit.
            let second_run = available - first_run;
            match emit_chunk(sink, &self.buf[0..second_run]) {
                Ok(second_emitted) => total += second_emitted,
                Err(err) if is_would_block(&err) => {
                    // Partial progress is committed; the rest ships on the
                    // next writable event (§7, "Partial send on wrap").
                }
                Err(err) => return Err(err).context("copy_to: wrapped emission"),
            }
        }

        let old_slot = cursor.read_idx;
        let new_slot = (cursor.read_idx + total) % self.capacity;
        self.readers[old_slot] = self.readers[old_slot].saturating_sub(1);
        self.readers[new_slot] += 1;
        cursor.read_idx = new_slot;

        Ok(total)
    }

    /// Returns true if `cursor` has no unread bytes.
    pub fn is_caught_up(&self, cursor: &Cursor) -> bool {
        cursor.read_idx == self.write_idx
    }

    fn distance(&self, from: usize, to: usize) -> usize {
        if to >= from {
            to - from
        } else {
            self.capacity - from + to
        }
    }
}

/// Emits as much of `chunk` as the sink accepts in one call. A `WouldBlock`
/// on the very first emission is the distinguished I/O error §4.3 describes
/// for the caller to classify (fatal for the shared path, isolating for a
/// single viewer).
fn emit_chunk(sink: &Sink<'_>, chunk: &[u8]) -> Result<usize> {
    if chunk.is_empty() {
        return Ok(0);
    }
    match sink.emit(chunk) {
        Ok(n) => Ok(n),
        Err(errno) if is_would_block_errno(errno) => Ok(0),
        Err(errno) => Err(anyhow::anyhow!(errno)).context("sink emit"),
    }
}

fn is_would_block_errno(errno: nix::errno::Errno) -> bool {
    matches!(errno, nix::errno::Errno::EAGAIN | nix::errno::Errno::EWOULDBLOCK)
}

fn is_would_block(err: &anyhow::Error) -> bool {
    err.downcast_ref::<nix::errno::Errno>()
        .is_some_and(|e| is_would_block_errno(*e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use proptest::prelude::*;
    use std::os::fd::AsFd;

    #[test]
    fn fresh_ring_has_full_headroom() {
        let ring = Ring::new(16);
        assert_eq!(ring.headroom(), 16);
    }

    #[test]
    fn caught_up_consumer_leaves_one_slot_reserved() {
        let mut ring = Ring::new(16);
        let _cursor = ring.attach();
        assert_eq!(ring.headroom(), 15);
    }

    #[test]
    fn attach_starts_at_write_frontier_not_at_history() {
        let mut ring = Ring::new(16);
        ring.write(b"0123456789");
        let cursor = ring.attach();
        assert!(ring.is_caught_up(&cursor));
    }

    #[test]
    fn detach_unpins_immediately() {
        let mut ring = Ring::new(4);
        let cursor = ring.attach();
        assert_eq!(ring.headroom(), 3);
        ring.detach(cursor);
        assert_eq!(ring.headroom(), 4);
    }

    #[test]
    fn two_consumers_at_same_slot_both_pin_it() {
        let mut ring = Ring::new(4);
        let c1 = ring.attach();
        let c2 = ring.attach();
        assert_eq!(ring.headroom(), 3);
        ring.detach(c1);
        // c2 still pins the slot.
        assert_eq!(ring.headroom(), 3);
        ring.detach(c2);
        assert_eq!(ring.headroom(), 4);
    }

    #[test]
    fn copy_to_is_idempotent_on_empty_ring() {
        let mut ring = Ring::new(8);
        let mut cursor = ring.attach();
        let (r, w) = pipe().unwrap();
        let n = ring.copy_to(&mut cursor, &Sink::File(w.as_fd())).unwrap();
        assert_eq!(n, 0);
        assert!(ring.is_caught_up(&cursor));
        drop(r);
    }

    #[test]
    fn produce_then_attach_then_drain_sees_only_new_bytes() {
        let mut ring = Ring::new(64);
        ring.write(b"ignored-history");
        let mut cursor = ring.attach();
        ring.write(b"fresh");

        let (r, w) = pipe().unwrap();
        let n = ring.copy_to(&mut cursor, &Sink::File(w.as_fd())).unwrap();
        assert_eq!(n, 5);
        drop(w);

        let mut out = [0u8; 5];
        nix::unistd::read(r, &mut out).unwrap();
        assert_eq!(&out, b"fresh");
    }

    #[test]
    fn wrap_around_write_then_drain_yields_correct_bytes() {
        let mut ring = Ring::new(8);
        let mut cursor = ring.attach();
        ring.write(b"ABCDEF"); // fills slots 0..6, write_idx = 6
        {
            let (r, w) = pipe().unwrap();
            let n = ring.copy_to(&mut cursor, &Sink::File(w.as_fd())).unwrap();
            assert_eq!(n, 6);
            drop(w);
            let mut out = [0u8; 6];
            nix::unistd::read(r, &mut out).unwrap();
            assert_eq!(&out, b"ABCDEF");
        }
        // write_idx is now 6; writing 4 more bytes wraps around slot 8 -> 0.
        ring.write(b"GHIJ");
        {
            let (r, w) = pipe().unwrap();
            let n = ring.copy_to(&mut cursor, &Sink::File(w.as_fd())).unwrap();
            assert_eq!(n, 4);
            drop(w);
            let mut out = [0u8; 4];
            nix::unistd::read(r, &mut out).unwrap();
            assert_eq!(&out, b"GHIJ");
        }
    }

    #[test]
    fn headroom_zero_when_slow_reader_pins_one_ahead() {
        let mut ring = Ring::new(8);
        let mut cursor = ring.attach();
        // Fill to capacity - 1 (the max while one caught-up reader is pinned).
        ring.write(&[b'x'; 7]);
        assert_eq!(ring.headroom(), 0);

        // Draining one byte frees exactly one slot of headroom.
        let (r, w) = pipe().unwrap();
        let n = ring.copy_to(&mut cursor, &Sink::File(w.as_fd())).unwrap();
        assert!(n >= 1);
        drop(w);
        drop(r);
        assert!(ring.headroom() >= 1);
    }

    proptest! {
        #[test]
        fn no_bytes_dropped_for_any_interleaving(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..5), 0..20)
        ) {
            // A single consumer attached before any writes must see every
            // byte produced afterward, in order, with no drops. §8's
            // universal invariant, specialized to one producer/one consumer
            // fully draining between writes so capacity never binds.
            let total: usize = chunks.iter().map(Vec::len).sum();
            let mut ring = Ring::new((total + 16).max(16));
            let mut cursor = ring.attach();
            let mut expected = Vec::new();
            let mut actual = Vec::new();

            for chunk in &chunks {
                if chunk.is_empty() {
                    continue;
                }
                ring.write(chunk);
                expected.extend_from_slice(chunk);

                let (r, w) = pipe().unwrap();
                let n = ring.copy_to(&mut cursor, &Sink::File(w.as_fd())).unwrap();
                drop(w);
                let mut buf = vec![0u8; n];
                if n > 0 {
                    nix::unistd::read(r.as_fd(), &mut buf).unwrap();
                }
                actual.extend_from_slice(&buf);
            }

            prop_assert_eq!(actual, expected);
        }

        #[test]
        fn write_idx_never_passes_a_pinned_slot(
            writes in proptest::collection::vec(1usize..5, 0..30)
        ) {
            // A never-draining consumer must keep headroom bounded by its
            // pin; the writer (modeled here by only ever writing up to
            // `headroom()` bytes, as the event loop does) can never be
            // told to write past it.
            let mut ring = Ring::new(16);
            let cursor = ring.attach();
            for want in writes {
                let n = want.min(ring.headroom());
                let bytes = vec![0xAAu8; n];
                ring.write(&bytes);
                prop_assert!(ring.headroom() < ring.capacity);
            }
            ring.detach(cursor);
        }
    }

    #[test]
    fn reader_count_sum_matches_active_consumers() {
        let mut ring = Ring::new(8);
        let c1 = ring.attach();
        let c2 = ring.attach();
        let c3 = ring.attach();
        assert_eq!(ring.readers.iter().map(|&n| n as usize).sum::<usize>(), 3);
        ring.detach(c2);
        assert_eq!(ring.readers.iter().map(|&n| n as usize).sum::<usize>(), 2);
        ring.detach(c1);
        ring.detach(c3);
        assert_eq!(ring.readers.iter().map(|&n| n as usize).sum::<usize>(), 0);
    }
}
