//! Shared API types used across the backend and the workbench frontend.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// One running preview server, as reported by the pool's stats snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct PreviewServerEntry {
    pub project_id: String,
    pub port: u16,
}

/// Observability snapshot of the preview server pool.
///
/// Consumed by the workbench status UI; contains no tokens or paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct PreviewServerStats {
    pub active_servers: usize,
    pub max_servers: usize,
    pub per_project_entries: Vec<PreviewServerEntry>,
}
