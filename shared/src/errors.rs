/// Unified error types for the Vidbot system.
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading configuration from the environment.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} is not a valid number: {value:?}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("SPLIT_CHUNK_LIMIT_MB ({split_mb}) must not exceed UPLOAD_LIMIT_MB ({upload_mb})")]
    ChunkAboveUploadLimit { split_mb: u64, upload_mb: u64 },
}

/// Errors from the durable settings document.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Settings I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Settings document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors related to running an external tool as a subprocess.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("Failed waiting for {program}: {source}")]
    WaitFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Rejected user input that cannot be turned into a fetchable URL.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Message is empty")]
    Empty,

    #[error("Not an http(s) link: {0}")]
    NotAUrl(String),
}

/// A single upload that did not complete.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct DeliveryError(pub String);

/// Failures of one fetch -> deliver run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Downloader exited non-zero, timed out or could not be spawned.
    #[error("Download failed: {0}")]
    Fetch(String),

    /// Downloader reported success but left no matching file behind.
    #[error("Download finished but no file starting with {base_name:?} was found in {dir:?}")]
    ArtifactNotFound { base_name: String, dir: PathBuf },

    #[error("Compression failed: {0}")]
    Transcode(String),

    #[error("Could not read media duration: {0}")]
    Probe(String),

    #[error("Splitting failed: {0}")]
    Split(String),

    #[error("Upload failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Short text suitable for a chat reply.
    pub fn user_message(&self) -> String {
        excerpt(&self.to_string(), USER_EXCERPT_CHARS)
    }
}

/// Upper bound on error text echoed back into the chat.
pub const USER_EXCERPT_CHARS: usize = 600;

/// Keep the tail of a diagnostic, where tools like yt-dlp put the actual error.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max_chars).collect();
    format!("…{}", tail)
}
