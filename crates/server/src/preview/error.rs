use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced to the host application.
///
/// HTTP-level failures (401/403/404/405/500) are answered to the preview
/// frame directly and never appear here.
#[derive(Debug, Error)]
pub enum PreviewServerError {
    #[error("no free port in range {low}-{high}")]
    NoPortAvailable { low: u16, high: u16 },

    #[error("could not bind preview listener on port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("project root {path:?} is missing, not a directory, or unregistered")]
    RootInvalid { path: PathBuf },

    #[error("path {path:?} resolves outside the project root")]
    PathEscape { path: String },

    #[error("preview server is not running")]
    NotStarted,

    #[error("project id {id:?} contains characters outside [A-Za-z0-9_-]")]
    InvalidProjectId { id: String },
}

impl PreviewServerError {
    /// Stable discriminator so UI code can localize without parsing prose.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoPortAvailable { .. } => "NoPortAvailable",
            Self::BindFailed { .. } => "BindFailed",
            Self::RootInvalid { .. } => "RootInvalid",
            Self::PathEscape { .. } => "PathEscape",
            Self::NotStarted => "NotStarted",
            Self::InvalidProjectId { .. } => "InvalidProjectId",
        }
    }
}
