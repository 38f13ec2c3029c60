//! Tandem: keep a directory tree in sync with remote peers.
//!
//! # Usage
//!
//! ```text
//! tandem [--debug] [DIR]
//! tandem --server [--debug] [--hostname NAME] [--exclude NAME]... [--max-memory BYTES] [DIR]
//! ```
//!
//! Client mode finds the repository containing `DIR` (default: the current
//! directory), connects to the peers listed in `.tandem/client_config` and
//! keeps them in sync until interrupted. Server mode speaks the sync protocol
//! on stdin/stdout; it is what the client starts on each peer.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use tandem_core::config::{DEFAULT_MEMORY_CEILING, MIN_MEMORY_CEILING};
use tandem_core::ExcludeSet;
use tandem_daemon::{debug_from_env, init_tracing, serve_stdio, start_blocking};

#[derive(Parser, Debug)]
#[command(
    name = "tandem",
    version,
    about = "Bidirectional file synchronization over ssh",
    long_about = None,
)]
struct Cli {
    /// Run as a peer: read requests on stdin, write responses on stdout.
    #[arg(long)]
    server: bool,

    /// Verbose diagnostics on stderr (also enabled by TANDEM_DEBUG=1).
    #[arg(long)]
    debug: bool,

    /// Label for this peer's log lines.
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Entry name to ignore everywhere (server mode; repeatable).
    #[arg(long = "exclude", value_name = "NAME")]
    exclude: Vec<String>,

    /// Memory ceiling in bytes (server mode).
    #[arg(long = "max-memory", value_name = "BYTES", default_value_t = DEFAULT_MEMORY_CEILING)]
    max_memory: usize,

    /// Directory to synchronize.
    dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let debug = cli.debug || debug_from_env();
    let dir = match cli.dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("cannot determine the working directory")?,
    };

    if cli.server {
        if cli.max_memory < MIN_MEMORY_CEILING {
            bail!("--max-memory must be at least {MIN_MEMORY_CEILING} bytes");
        }
        init_tracing(debug);
        serve_stdio(&dir, &cli.hostname, ExcludeSet::new(cli.exclude), cli.max_memory)
            .with_context(|| format!("server for {} failed", dir.display()))
    } else {
        start_blocking(&dir, debug).with_context(|| format!("sync of {} failed", dir.display()))
    }
}
