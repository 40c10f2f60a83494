// =============================================================================
// Matrixon Sliding Sync Proxy - Command Line
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// =============================================================================

use std::path::PathBuf;

use clap::Parser;

/// Returns the current version of the crate with extra info if supplied
///
/// Set the environment variable `MATRIXON_VERSION_EXTRA` at build time to
/// include it in parenthesis after the SemVer version.
pub fn version() -> String {
    let cargo_pkg_version = env!("CARGO_PKG_VERSION");

    match option_env!("MATRIXON_VERSION_EXTRA") {
        Some(x) => format!("{} ({})", cargo_pkg_version, x),
        None => cargo_pkg_version.to_owned(),
    }
}

/// Matrixon Sliding Sync Proxy
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(about, version = version(), name = "matrixon-sliding-proxy")]
pub struct Args {
    /// Path to configuration file
    #[clap(short, long, env = "SYNCV3_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter override (trace, debug, info, warn, error or a directive list)
    #[clap(short, long)]
    pub log_level: Option<String>,
}

/// Parse command line arguments
pub fn parse() -> Args {
    Args::parse()
}
