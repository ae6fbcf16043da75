//! Library code for the `termc` terminal-sharing server.
//!
//! `termc` runs an interactive shell under a pseudoterminal, mirrors its
//! output to the local screen, and fans the same byte stream out to any
//! number of read-only TCP viewers. This crate does not forbid unsafe code
//! because it talks directly to POSIX APIs for PTYs, signals, and raw
//! terminal mode.

#![allow(unsafe_code)]
#![warn(missing_docs)]

pub mod child;
pub mod cli;
pub mod event_loop;
pub mod listener;
pub mod logging;
pub mod registry;
pub mod ring;
pub mod terminal;
