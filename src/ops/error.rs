//! Crate-level error taxonomy
//!
//! The per-module errors are folded into a small set of discriminable
//! kinds at the operations boundary. Messages keep the stable
//! substrings lower layers produce ("not allowed", "not found",
//! "not installed", "output file exists", ...).

use thiserror::Error;

use crate::config::ConfigError;
use crate::core::archive::ArchiveError;
use crate::core::artifact::ArtifactError;
use crate::core::generator::GeneratorError;
use crate::core::index::IndexError;
use crate::core::resolver::ResolveError;
use crate::core::version::VersionError;
use crate::hooks::HookError;
use crate::io::download::DownloadError;
use crate::io::http::HttpError;
use crate::io::sync::SyncError;
use crate::store::db::DbError;

/// Convenience alias for operations returning [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds surfaced by the orchestrator and CLI.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad user input, bad source layout, malformed data.
    #[error("{0}")]
    Validation(String),

    /// Missing file, artifact or installed record.
    #[error("{0}")]
    NotFound(String),

    /// Connect, refuse, timeout or non-success HTTP status.
    #[error("{0}")]
    Network(String),

    /// Size or SHA-256 disagreement.
    #[error("{0}")]
    ChecksumMismatch(String),

    /// The resolver could not satisfy the constraints.
    #[error("{0}")]
    DependencyConflict(String),

    /// A hook script failed to parse, raised, or timed out.
    #[error("{0}")]
    HookFailed(String),

    /// Disk full, permission denied, other filesystem failures.
    #[error("{0}")]
    Io(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(format!("IO error: {e}"))
    }
}

impl From<ArchiveError> for Error {
    fn from(e: ArchiveError) -> Self {
        match e {
            ArchiveError::NotFound(_) | ArchiveError::EntryNotFound(_) => {
                Error::NotFound(e.to_string())
            }
            ArchiveError::Io(_) => Error::Io(e.to_string()),
            ArchiveError::InvalidPath(_) | ArchiveError::Unsupported(_) => {
                Error::Validation(e.to_string())
            }
        }
    }
}

impl From<ArtifactError> for Error {
    fn from(e: ArtifactError) -> Self {
        match e {
            ArtifactError::Archive(inner) => inner.into(),
            ArtifactError::Io(_) => Error::Io(e.to_string()),
            ArtifactError::ChecksumMismatch { .. } | ArtifactError::SizeMismatch { .. } => {
                Error::ChecksumMismatch(e.to_string())
            }
            ArtifactError::Manifest(_)
            | ArtifactError::Validation(_)
            | ArtifactError::FileSetMismatch { .. } => Error::Validation(e.to_string()),
        }
    }
}

impl From<IndexError> for Error {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Io(_) => Error::Io(e.to_string()),
            IndexError::Json(_) | IndexError::Validation(_) => Error::Validation(e.to_string()),
        }
    }
}

impl From<GeneratorError> for Error {
    fn from(e: GeneratorError) -> Self {
        match e {
            GeneratorError::Io(_) => Error::Io(e.to_string()),
            GeneratorError::Artifact(inner) => inner.into(),
            GeneratorError::Index(inner) => inner.into(),
            GeneratorError::Validation(_) => Error::Validation(e.to_string()),
        }
    }
}

impl From<VersionError> for Error {
    fn from(e: VersionError) -> Self {
        Error::Validation(e.to_string())
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Io(_) => Error::Io(e.to_string()),
            _ => Error::Validation(e.to_string()),
        }
    }
}

impl From<HttpError> for Error {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Cancelled => Error::Cancelled,
            HttpError::Io(_) => Error::Io(e.to_string()),
            _ => Error::Network(e.to_string()),
        }
    }
}

impl From<SyncError> for Error {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Cancelled => Error::Cancelled,
            SyncError::Http(inner) => inner.into(),
            SyncError::Io(_) => Error::Io(e.to_string()),
            SyncError::Index(_) => Error::Validation(e.to_string()),
            SyncError::Failed(_) => Error::Network(e.to_string()),
        }
    }
}

impl From<DownloadError> for Error {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::Cancelled => Error::Cancelled,
            DownloadError::Http(inner) => inner.into(),
            DownloadError::Io(_) => Error::Io(e.to_string()),
            DownloadError::ChecksumMismatch { .. } | DownloadError::SizeMismatch { .. } => {
                Error::ChecksumMismatch(e.to_string())
            }
        }
    }
}

impl From<DbError> for Error {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Io(_) => Error::Io(e.to_string()),
            DbError::NotInstalled(_) => Error::NotFound(e.to_string()),
            DbError::Json(_) | DbError::UnsupportedSchema(_) | DbError::AlreadyInstalled(_) => {
                Error::Validation(e.to_string())
            }
        }
    }
}

impl From<HookError> for Error {
    fn from(e: HookError) -> Self {
        match e {
            HookError::Cancelled { .. } => Error::Cancelled,
            _ => Error::HookFailed(e.to_string()),
        }
    }
}

impl From<ResolveError> for Error {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::NotFound(_) | ResolveError::NotInstalled(_) => {
                Error::NotFound(e.to_string())
            }
            ResolveError::Conflict { .. }
            | ResolveError::Cycle(_)
            | ResolveError::DidNotConverge => Error::DependencyConflict(e.to_string()),
            ResolveError::NoPackages | ResolveError::Version(_) | ResolveError::Index(_) => {
                Error::Validation(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_survive_conversion() {
        let e: Error = ArchiveError::NotFound("x.gotya".into()).into();
        assert!(matches!(e, Error::NotFound(_)));
        assert!(e.to_string().contains("not found"));

        let e: Error = DbError::NotInstalled("tool".into()).into();
        assert!(matches!(e, Error::NotFound(_)));
        assert!(e.to_string().contains("not installed"));

        let e: Error = DownloadError::ChecksumMismatch {
            url: "u".into(),
            expected: "e".into(),
            actual: "a".into(),
        }
        .into();
        assert!(matches!(e, Error::ChecksumMismatch(_)));

        let e: Error = HookError::Failed {
            hook: "pre-install".into(),
            message: "boom".into(),
        }
        .into();
        assert!(matches!(e, Error::HookFailed(_)));

        let e: Error = HttpError::Cancelled.into();
        assert!(matches!(e, Error::Cancelled));

        let e: Error = ResolveError::NoPackages.into();
        assert!(matches!(e, Error::Validation(_)));
        assert!(e.to_string().contains("no packages specified"));
    }
}
