//! Preview File Server Module
//!
//! Provides per-project HTTP servers for serving preview iframe content.
//! This isolates preview content from the main application for security.
//!
//! Each project gets its own loopback listener guarded by an ephemeral access
//! token. The [`ProjectServerManager`] bounds the pool, evicts the least
//! recently used server when full, and reaps servers that sit idle.

use std::sync::OnceLock;
use std::time::Instant;

mod config;
mod error;
mod file_server;
mod manager;
mod mime;
mod port_manager;
mod token;

pub use config::PreviewConfig;
pub use error::PreviewServerError;
pub use file_server::LocalFileServer;
pub use manager::ProjectServerManager;
pub use port_manager::PortManager;
pub use token::AccessToken;

/// Process-local monotonic clock epoch. Set once on first use, read by
/// request handlers and the idle reaper.
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed on the process-local monotonic clock.
///
/// All `last_accessed` stamps are readings of this clock, so comparisons
/// never go backwards even if the wall clock does.
pub(crate) fn monotonic_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}
