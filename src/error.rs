//! Error types for supervisor operations

use crate::swap::Role;
use std::path::PathBuf;
use std::time::Duration;

/// Errors surfaced by the supervision layer
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("llama-server binary not found (searched: {searched})")]
    BinaryNotFound { searched: String },

    #[error("model file not found: {0:?}")]
    ModelNotFound(PathBuf),

    #[error("server already running with model {0}")]
    AlreadyRunning(String),

    #[error("failed to spawn llama-server: {0}")]
    StartFailed(#[source] std::io::Error),

    #[error("server not healthy after {0:?}")]
    HealthTimeout(Duration),

    #[error("insufficient VRAM: {free_mb}MB free, {required_mb}MB required")]
    VramInsufficient { free_mb: u64, required_mb: u64 },

    #[error("model swap already in progress")]
    SwapInProgress,

    #[error("no model configured for role {0}")]
    RoleNotConfigured(Role),

    #[error(
        "download of {filename} interrupted at {downloaded}/{total} bytes, partial file kept at {partial:?}"
    )]
    DownloadInterrupted {
        filename: String,
        downloaded: u64,
        total: u64,
        partial: PathBuf,
        #[source]
        source: reqwest::Error,
    },

    #[error(
        "download of {filename} ended at {downloaded}/{total} bytes, partial file kept at {partial:?}"
    )]
    DownloadIncomplete {
        filename: String,
        downloaded: u64,
        total: u64,
        partial: PathBuf,
    },

    #[error("partial download {partial:?} is corrupt ({actual} bytes, expected {expected}) and was deleted")]
    DownloadCorrupt {
        partial: PathBuf,
        actual: u64,
        expected: u64,
    },

    #[error("watchdog gave up after {0} restarts")]
    WatchdogExhausted(u32),

    #[error("watchdog already running")]
    WatchdogAlreadyRunning,

    #[error("llama-server is not running")]
    NotRunning,

    #[error("no model loaded")]
    NoModelLoaded,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("llama-server returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

impl SupervisorError {
    /// True for errors that leave resumable state on disk
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            SupervisorError::DownloadInterrupted { .. } | SupervisorError::DownloadIncomplete { .. }
        )
    }
}
