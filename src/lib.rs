// =============================================================================
// Matrixon Sliding Sync Proxy - Library Crate
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Sliding sync proxy in front of a Matrix homeserver: upstream pollers
//   feed a shared per-account cache that serves windowed, long-polled room
//   list diffs to clients.
//
// =============================================================================

pub mod api;
pub mod config;
pub mod database;
pub mod service;
pub mod utils;

pub use config::Config;
pub use service::Services;
pub use utils::error::{Error, Result};
