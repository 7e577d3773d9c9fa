#![forbid(unsafe_code)]
//! Error types for SlateFS.
//!
//! SlateFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `sfs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `FsError` | `sfs-error` (this crate) | User-facing errors for the shell and API consumers |
//!
//! `sfs-error` is intentionally independent of `sfs-types` and `sfs-ondisk`
//! to avoid cyclic dependencies. Parse failures are converted at their crate
//! boundaries: during mount-time validation they become [`FsError::Format`];
//! during volume creation a layout that does not fit becomes
//! [`FsError::Size`].
//!
//! Propagation policy: allocation and path-resolution failures are
//! recoverable and never corrupt in-memory state. `Format` and `Io` during
//! mount are fatal to that mount attempt only — the façade instance is
//! discarded, not the process.

use thiserror::Error;

/// Unified error type for all SlateFS operations.
///
/// This is the canonical error type returned by the shell and public API
/// surfaces. Internal crate-specific errors (e.g., `ParseError` from
/// `sfs-types`) are converted into `FsError` at crate boundaries.
#[derive(Debug, Error)]
pub enum FsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid on-disk format (bad magic, truncated metadata, malformed
    /// structure). Fatal to the mount attempt that raised it.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Requested volume layout does not fit the block count.
    #[error("volume layout does not fit: {0}")]
    Size(String),

    /// No free blocks or inodes available.
    #[error("no space left on device")]
    NoSpace,

    /// Address or index beyond structure bounds.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Double free, malformed path, or otherwise unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// File, directory, or path component not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Target name already exists in the parent directory.
    #[error("already exists: {0}")]
    Exists(String),

    /// Operation issued before mount or after unmount.
    #[error("filesystem not mounted")]
    NotMounted,
}

/// Result alias using `FsError`.
pub type Result<T> = std::result::Result<T, FsError>;
