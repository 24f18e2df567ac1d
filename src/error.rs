//! Error and warning types for the `tarmeta` crate.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// The primary error type for all operations in the `tarmeta` crate.
///
/// Every failure mode a caller may want to branch on is a distinct variant,
/// so automated callers (backup drivers, scripts) never need to inspect
/// error strings.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// A requested path or archive member does not exist.
    #[error("{}: not found", path.display())]
    NotFound { path: PathBuf },

    /// A metadata item with the given key is not present in the manifest.
    #[error("metadata item '{0}' not found")]
    MetadataNotFound(String),

    /// The container is not a recognized archive: the first member is not a
    /// parseable manifest, or the manifest declares an unsupported major
    /// version.
    #[error("invalid archive format: {0}")]
    Format(String),

    /// The manifest parsed structurally but violates an invariant, such as
    /// a duplicate path or a missing required field.
    #[error("corrupt manifest: {0}")]
    CorruptManifest(String),

    /// Raised by callers that treat any verification failure as fatal.
    /// [`Archive::verify`](crate::archive::Archive::verify) itself returns
    /// the failure list instead of this error.
    #[error("integrity check failed: {} failure(s)", .0.len())]
    Integrity(Vec<VerifyFailure>),

    /// An invalid argument combination, e.g. a base directory that is not
    /// an ancestor of a requested path.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An I/O error, with the path where it happened when known.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

impl ArchiveError {
    /// Attach a path to an I/O error: `File::open(p).map_err(ArchiveError::io(p))`.
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| ArchiveError::Io { source, path }
    }
}

// Generic IO error conversion that doesn't carry a path
impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Io { source: err, path: PathBuf::new() }
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// One finding reported by [`Archive::verify`](crate::archive::Archive::verify).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyFailure {
    /// Manifest path of the offending entry.
    pub path: PathBuf,
    pub kind: FailureKind,
}

/// The kind of mismatch found between a manifest entry and the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The container has no member for this manifest entry.
    Missing,
    /// The member exists but has a different type than the manifest records.
    TypeMismatch,
    /// The member content does not hash to the recorded checksum.
    ChecksumMismatch,
    /// A symbolic or hard link points somewhere else than recorded.
    LinkTargetMismatch,
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            FailureKind::Missing => "missing",
            FailureKind::TypeMismatch => "wrong type",
            FailureKind::ChecksumMismatch => "checksum does not match",
            FailureKind::LinkTargetMismatch => "wrong link target",
        };
        write!(f, "{}: {}", self.path.display(), what)
    }
}

/// Non-fatal notices emitted during archive creation.
///
/// The core never prints; it hands warnings to the sink the caller passed
/// to [`Archive::create`](crate::archive::Archive::create).
#[derive(Debug, Clone)]
pub enum ArchiveWarning {
    /// A path of unsupported type (FIFO, socket, device node) was skipped
    /// and left out of the manifest.
    UnsupportedType { path: PathBuf },
}

impl fmt::Display for ArchiveWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveWarning::UnsupportedType { path } => {
                write!(f, "{}: unsupported file type, skipping", path.display())
            }
        }
    }
}

/// Callback through which creation reports non-fatal warnings.
pub type WarningSink<'a> = &'a mut dyn FnMut(ArchiveWarning);
