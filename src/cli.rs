//! Command-line arguments for the `termc` binary.

use clap::Parser;

/// Shares your terminal over TCP, read-only, to any number of viewers.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Shell command to run under the pseudoterminal.
    ///
    /// Falls back to `$SHELL`, then to `bash`, if not given.
    #[clap(long, env = "TERMC_SHELL")]
    pub shell: Option<String>,

    /// TCP port to listen for viewers on.
    #[clap(long, env = "TERMC_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Capacity in bytes of the shared ring buffer.
    #[clap(long, env = "TERMC_RING_CAPACITY", default_value_t = 1 << 16)]
    pub ring_capacity: usize,
}
