//! Error types for the defender middleware.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DefenderError {
    #[error("invalid IP range {0:?}: not a known bundle or a valid CIDR")]
    InvalidRange(String),

    #[error("blocklist entry must be in CIDR form (e.g. 203.0.113.0/24): {0}")]
    NotCidr(String),

    #[error("blocklist file path cannot be empty")]
    EmptyPath,

    #[error("failed to open blocklist file {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read blocklist file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no usable entries in blocklist file: {0}")]
    EmptyBlocklist(PathBuf),

    #[error("invalid responder configuration: {0}")]
    InvalidResponder(String),

    #[error("invalid tarpit configuration: {0}")]
    TarpitConfig(String),

    #[error("failed to persist dynamic blocklist to {path}: {source}")]
    PersistFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, DefenderError>;
