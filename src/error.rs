// src/error.rs

use thiserror::Error;

/// Core error types for Parcel
///
/// The transaction-result variants (`AlreadyInstalled` through
/// `DownloadFailed`, plus `Internal`) form the closed set of codes front
/// ends may match on; everything else is engine-session plumbing.
#[derive(Error, Debug)]
pub enum Error {
    /// Package is already installed; nothing was done
    #[error("Package {0} is already installed")]
    AlreadyInstalled(String),

    /// Package is not installed; nothing was done
    #[error("Package {0} is not installed")]
    NotInstalled(String),

    /// No package with this name is known to any configured source
    #[error("Package {0} not found")]
    NotFound(String),

    /// Package is known but not downloadable from any configured source
    #[error("Package {0} is not available from any configured source")]
    NotAvailable(String),

    /// Dependency resolution failed before any download was attempted
    #[error("Cannot satisfy dependencies: {}", .0.join(", "))]
    DependenciesFailed(Vec<String>),

    /// A download failed after exhausting retries
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    /// Unpack/configure step failed after downloads succeeded; in-memory and
    /// on-disk state may be inconsistent and the session should be reloaded
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed input (config line, control record, version string)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another engine instance holds the lock file
    #[error("Could not acquire lock file {0}")]
    LockHeld(String),

    /// Downloaded file does not match its published checksum
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// Result type alias using Parcel's Error type
pub type Result<T> = std::result::Result<T, Error>;
