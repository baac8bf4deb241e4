// src/error.rs

//! Error types for the activation engine
//!
//! A single crate-wide error enum is used throughout; every component
//! surfaces a domain-specific variant with a carried message. Operations
//! never panic on expected failures.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the activation engine
#[derive(Error, Debug)]
pub enum Error {
    /// The package file or directory could not be opened
    #[error("failed to open package '{}': {reason}", path.display())]
    OpenFailed { path: PathBuf, reason: String },

    /// A required entry is absent from the package
    #[error("package '{}' has no entry named '{entry}'", path.display())]
    MissingEntry { path: PathBuf, entry: String },

    /// The package manifest is malformed
    #[error("invalid manifest: {0}")]
    BadManifest(String),

    /// The signature block could not be read or is malformed
    #[error("verity signature validation failed: {0}")]
    VerityBadSignature(String),

    /// No trusted public key exists for the package
    #[error("no trusted key named '{0}' found in any key directory")]
    VerityNoKey(String),

    /// A trusted key exists but does not match the embedded key
    #[error("embedded public key does not match trusted key for '{0}'")]
    VerityKeyMismatch(String),

    /// Loop device allocation or configuration failed
    #[error("loop device operation failed: {0}")]
    Loop(String),

    /// Device-mapper operation failed
    #[error("device-mapper operation failed: {0}")]
    Dm(String),

    /// Mounting or unmounting failed
    #[error("mount operation failed: {0}")]
    Mount(String),

    /// The package version is already mounted and published as latest
    #[error("package is already active: {0}")]
    AlreadyActive(String),

    /// No mounted instance matches the request
    #[error("not found: {0}")]
    NotFound(String),

    /// The mounted instance is the current latest and cannot be unmounted
    #[error("package is active: {0}")]
    IsActive(String),

    /// Staged-session bookkeeping failed
    #[error("session error: {0}")]
    Session(String),

    /// A pre- or post-install hook failed
    #[error("hook execution failed: {0}")]
    Hook(String),

    /// The request itself is unusable (e.g. an empty batch)
    #[error("bad input: {0}")]
    BadInput(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
