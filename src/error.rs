use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ListingError {
    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to parse snapshot {path}: {message}")]
    SnapshotParse { path: String, message: String },

    #[error("failed to write listing cache: {0}")]
    CacheWrite(String),

    #[error("sample catalog request failed: {0}")]
    MaterialHttp(String),

    #[error("sample catalog returned status {status}: {message}")]
    MaterialStatus { status: u16, message: String },

    #[error("sample listing refresh failed: {0}")]
    RefreshFailed(String),

    #[error("invalid row key: {0}")]
    InvalidRowKey(String),

    #[error("invalid filter expression: {0}")]
    InvalidFilter(String),

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("sample not found: {0}")]
    SampleNotFound(String),

    #[error("failed to export sample listing: {0}")]
    Export(String),
}
