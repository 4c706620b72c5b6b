//! # NBS Common
//!
//! Shared error types, logging setup, and proxy configuration for the NBS
//! offline cache proxy.
//!
//! ## Features
//!
//! - Unified error type
//! - `tracing` subscriber setup (pretty, compact, JSON)
//! - JSON configuration file with defaults matching the shipped worker
//! - Result extension trait for storage paths

use std::path::PathBuf;
use thiserror::Error;

pub mod config;
pub mod logging;

pub use config::{CacheSection, LogSection, ProxyConfig};
pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat};

/// Unified error type shared by the NBS crates.
#[derive(Error, Debug)]
pub enum NbsError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Storage errors (cache directories, entry files).
    #[error("Storage error at {path}: {message}")]
    Storage { path: PathBuf, message: String },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl NbsError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error for a path.
    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            NbsError::Config { .. } => "config",
            NbsError::Storage { .. } => "storage",
            NbsError::Io(_) => "io",
            NbsError::Json(_) => "json",
            NbsError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Result type alias for NBS operations.
pub type Result<T> = std::result::Result<T, NbsError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Attach the path being operated on as a storage error.
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| NbsError::storage(path, e.to_string()))
    }
}
