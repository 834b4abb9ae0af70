//! Error types for `subrun` core library.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `subrun` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// NDJSON parsing error
    #[error("Failed to parse NDJSON: {0}")]
    NdjsonParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Agents document (`.agents/config.toml`) could not be read or decoded.
    #[error("Agents config {path}: {reason}")]
    AgentsConfig { path: PathBuf, reason: String },

    /// Skill definition could not be parsed.
    #[error("Skill {path}: {reason}")]
    Skill { path: PathBuf, reason: String },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
