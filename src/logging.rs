//! Stderr log formatting for `termc`.
//!
//! The reference implementation writes raw, hand-formatted lines straight to
//! `STDERR_FILENO`: `(termc) LEVEL: message`, optionally followed by
//! `errno=NNN <description>`. This module reproduces that exact grammar on
//! top of `tracing`/`tracing-subscriber`, the logging stack the teacher
//! crate (`crates/sshx`) already depends on, so the rest of the codebase can
//! just call `tracing::warn!`/`tracing::error!` like `terminal/unix.rs` does
//! (`trace!(%child, "creating new terminal")`) instead of writing to stderr
//! by hand.

use std::fmt;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Marks an `ERROR`-level event as an "UNEXPECTED ERROR" rather than a plain
/// "ERROR" in the spec's three-level taxonomy. Set it with
/// `tracing::error!(unexpected = true, ...)`.
pub const UNEXPECTED_FIELD: &str = "unexpected";

/// Installs the global `tracing` subscriber used for the whole process.
///
/// Mirrors `tracing_subscriber::fmt::init()` from `crates/sshx/src/main.rs`,
/// but swaps in [`TermcFormat`] so that warnings and errors land on stderr in
/// the exact `(termc) LEVEL: ...` shape the spec requires, while lower
/// severities (trace/debug/info) keep a normal, human-readable form for
/// local debugging.
pub fn init() {
    tracing_subscriber::fmt()
        .event_format(TermcFormat)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Custom `tracing-subscriber` formatter producing `(termc)`-prefixed lines.
pub struct TermcFormat;

impl<S, N> FormatEvent<S, N> for TermcFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let level_label = match *meta.level() {
            Level::WARN => "WARNING",
            Level::ERROR if visitor.unexpected => "UNEXPECTED ERROR",
            Level::ERROR => "ERROR",
            _ => {
                // Non-operator-facing severities keep the library's normal
                // structured form; only WARN/ERROR carry the spec's grammar.
                write!(writer, "(termc) {} ", meta.level())?;
                ctx.field_format().format_fields(writer.by_ref(), event)?;
                return writeln!(writer);
            }
        };

        write!(writer, "(termc) {level_label}: ")?;
        if let Some(message) = &visitor.message {
            write!(writer, "{message}")?;
        } else {
            ctx.field_format().format_fields(writer.by_ref(), event)?;
        }
        if let Some(errno) = visitor.errno {
            write!(writer, " errno={errno:03} ")?;
            if let Some(description) = &visitor.description {
                write!(writer, "{description}")?;
            } else {
                write!(writer, "{}", std::io::Error::from_raw_os_error(errno))?;
            }
        }
        writeln!(writer)
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
    errno: Option<i32>,
    description: Option<String>,
    unexpected: bool,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = Some(format!("{value:?}")),
            "description" => self.description = Some(format!("{value:?}")),
            UNEXPECTED_FIELD => self.unexpected = format!("{value:?}") == "true",
            _ => {}
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "description" => self.description = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "errno" {
            self.errno = Some(value as i32);
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "errno" {
            self.errno = Some(value as i32);
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == UNEXPECTED_FIELD {
            self.unexpected = value;
        }
    }
}

/// Logs an I/O failure at the `UNEXPECTED ERROR` level with its errno.
///
/// Used on the shared path (PTY, stdin, stdout, ring, termios) per §7 of the
/// spec: these errors are always fatal, so the caller is expected to exit
/// immediately after calling this.
pub fn unexpected_io_error(context: &str, err: &std::io::Error) {
    match err.raw_os_error() {
        Some(errno) => {
            tracing::error!(unexpected = true, errno, description = %err, "{context}")
        }
        None => tracing::error!(unexpected = true, "{context}: {err}"),
    }
}

/// Logs a per-viewer I/O failure at the plain `ERROR` level.
///
/// Per §7, viewer errors are isolated to that viewer and never fatal.
pub fn viewer_io_error(context: &str, err: &std::io::Error) {
    match err.raw_os_error() {
        Some(errno) => tracing::error!(errno, description = %err, "{context}"),
        None => tracing::error!("{context}: {err}"),
    }
}

/// Logs a recoverable condition at the `WARNING` level.
pub fn warning(context: &str) {
    tracing::warn!("{context}");
}
