//! Error types for the packaging pipeline.
//!
//! Every variant records the operation that failed and, where one is involved,
//! the path it failed on, and keeps the underlying error as its `source`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for packaging operations.
pub type PackageResult<T> = Result<T, PackageError>;

/// Errors produced while building a package.
#[derive(Debug, Error)]
pub enum PackageError {
    /// IO failures while interacting with the filesystem.
    #[error("{operation} failed for {}", path.display())]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Path involved in the IO failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Archive writer failures.
    #[error("{operation} failed for archive {}", path.display())]
    Zip {
        /// Operation that triggered the archive failure.
        operation: &'static str,
        /// Archive path.
        path: PathBuf,
        /// Underlying zip error.
        source: zip::result::ZipError,
    },
    /// Metadata serialization failures.
    #[error("{operation} failed to serialize metadata")]
    Json {
        /// Operation that triggered the JSON failure.
        operation: &'static str,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
    /// A caller-supplied input was rejected before the job started.
    #[error("invalid {field}: {reason}")]
    InvalidInput {
        /// Input that failed validation.
        field: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// A required callback was not supplied.
    #[error("missing required callback `{name}`")]
    MissingCallback {
        /// Name of the callback.
        name: &'static str,
    },
    /// The special-copy hook claimed to have produced a file that does not exist.
    #[error("special copy reported success but {} was not created", path.display())]
    SpecialCopyMissing {
        /// Destination the hook was asked to write.
        path: PathBuf,
    },
    /// The special-copy hook itself failed.
    #[error("special copy of {} failed", path.display())]
    SpecialCopy {
        /// Source file handed to the hook.
        path: PathBuf,
        /// Error returned by the hook.
        source: anyhow::Error,
    },
    /// Two inputs normalize to the same staged name.
    #[error("{} collides with another packaged file named {name}", path.display())]
    NameCollision {
        /// Input that was dropped.
        path: PathBuf,
        /// The shared normalized name.
        name: String,
    },
    /// The job was asked to move between states in an order the pipeline forbids.
    #[error("cannot {operation} while the job is {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the job was in.
        state: crate::package::JobState,
    },
    /// A packager runs one job at a time.
    #[error("a packaging job is already running")]
    Busy,
    /// The worker thread could not be started or panicked.
    #[error("packaging worker failed: {reason}")]
    Worker {
        /// Static reason for the failure.
        reason: &'static str,
    },
}

impl PackageError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn zip(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: zip::result::ZipError,
    ) -> Self {
        Self::Zip {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) const fn json(operation: &'static str, source: serde_json::Error) -> Self {
        Self::Json { operation, source }
    }

    pub(crate) const fn invalid_input(
        field: &'static str,
        reason: &'static str,
        value: Option<String>,
    ) -> Self {
        Self::InvalidInput {
            field,
            reason,
            value,
        }
    }
}

/// The recursive delete gave up on a directory.
///
/// This is carried inside an [`io::Error`] whose kind matches the last failure,
/// so callers can still match on the kind and recover the path.
#[derive(Debug, Error)]
#[error("could not delete directory {}", path.display())]
pub struct DeleteDirectoryError {
    /// Directory that could not be removed.
    pub path: PathBuf,
    /// Last failure observed while removing it.
    #[source]
    pub source: io::Error,
}
