//! Error types for tarstash.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Caller errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Store errors
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("failed to find cached objects among keys {keys:?}")]
    NoMatchingObject { keys: Vec<String> },

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("store error: {0}")]
    Store(String),

    // Local filesystem errors
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Archive errors
    #[error("{name}: unsupported entry type {type_code:?}")]
    UnsupportedEntryType { name: String, type_code: char },

    #[error("{0}: entry path escapes the destination directory")]
    UnsafeEntryPath(PathBuf),

    #[error("cancelled")]
    Cancelled,

    #[error("glob error: {0}")]
    Glob(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),

    // Wrappers
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{primary}: {release}")]
    Release {
        primary: Box<Error>,
        #[source]
        release: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], looking through context layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PreconditionFailed,
    Io,
    UnsupportedEntryType,
    Cancelled,
    Other,
}

impl Error {
    /// Build an [`Error::Io`] naming what was being done and to which path.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) | Error::NoMatchingObject { .. } => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Error::Io { .. } | Error::UnsafeEntryPath(_) => ErrorKind::Io,
            Error::UnsupportedEntryType { .. } => ErrorKind::UnsupportedEntryType,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Context { source, .. } => source.kind(),
            // The operational failure decides what the caller sees.
            Error::Release { primary, .. } => primary.kind(),
            Error::Store(_) | Error::Glob(_) | Error::Serialization(_) | Error::Internal(_) => {
                ErrorKind::Other
            }
        }
    }

    /// True when a conditional create lost to an object that already exists.
    pub fn is_create_conflict(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AlreadyExists | ErrorKind::PreconditionFailed
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Adds operation and entity context to an error while keeping its kind.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|source| Error::Context {
            context: context.into(),
            source: Box::new(source),
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| Error::Context {
            context: f().into(),
            source: Box::new(source),
        })
    }
}

/// Merge the outcome of an operation with the outcome of releasing the
/// resource it used. Neither failure is dropped: a release failure after an
/// operational failure yields [`Error::Release`], and a release failure on its
/// own becomes the reported error.
pub fn combine_release<T>(result: Result<T>, release: Result<()>) -> Result<T> {
    match (result, release) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release)) => Err(release),
        (Err(primary), Ok(())) => Err(primary),
        (Err(primary), Err(release)) => Err(Error::Release {
            primary: Box::new(primary),
            release: Box::new(release),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kind_sees_through_context() {
        let err: Result<()> = Err(Error::NotFound("k".into()));
        let err = err.context("stat k").context("save").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "save: stat k: object not found: k");
    }

    #[test]
    fn test_combine_release_keeps_both_causes() {
        let result: Result<()> = Err(Error::Store("upload failed".into()));
        let release = Err(Error::Store("close failed".into()));
        let err = combine_release(result, release).unwrap_err();
        match &err {
            Error::Release { primary, release } => {
                assert_eq!(primary.to_string(), "store error: upload failed");
                assert_eq!(release.to_string(), "store error: close failed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "store error: upload failed: store error: close failed"
        );
    }

    #[test]
    fn test_combine_release_reports_release_error_alone() {
        let err = combine_release(Ok(7), Err(Error::Store("close failed".into()))).unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(combine_release(Ok(7), Ok(())).unwrap(), 7);
    }

    #[test]
    fn test_create_conflict_kinds() {
        assert!(Error::PreconditionFailed("k".into()).is_create_conflict());
        assert!(Error::AlreadyExists("k".into()).is_create_conflict());
        assert!(!Error::Store("boom".into()).is_create_conflict());
    }

    #[test]
    fn test_unsupported_entry_type_names_code() {
        let err = Error::UnsupportedEntryType {
            name: "a/b".into(),
            type_code: 'S',
        };
        assert_eq!(err.to_string(), "a/b: unsupported entry type 'S'");
    }
}
