//! Command-line surface for the embedding binary. The DAAP wire layer and
//! Zeroconf advertisement are external collaborators; this CLI only drives
//! the core: load configuration, run the catalog through one or more sync
//! passes, or start the long-running scheduler.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "subdaap-bridge", version, about = "Subsonic-to-DAAP catalog and streaming bridge")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the scheduler and keep running: startup/interval sync plus
    /// periodic cache expiry and eviction.
    Serve,

    /// Run a single synchronization pass against every configured origin
    /// and exit, without starting the periodic scheduler.
    Sync,

    /// Re-index both file caches against the catalog's permanently-pinned
    /// item set and prefetch anything missing on disk.
    Cache,
}
