//! Cache requests and results.

use crate::archiver::ArchiveStats;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tarstash_core::{CacheObject, Error, Result};

/// Request to save a directory under a cache key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveRequest {
    /// Bucket to save into.
    pub bucket: String,
    /// Cache key; becomes the object name.
    pub key: String,
    /// Directory on disk to cache.
    pub dir: PathBuf,
}

impl SaveRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            dir: dir.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(Error::InvalidArgument("missing bucket".into()));
        }
        if self.key.is_empty() {
            return Err(Error::InvalidArgument("missing key".into()));
        }
        if self.dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("missing directory".into()));
        }
        Ok(())
    }
}

/// Request to restore the best match among several keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Bucket to restore from.
    pub bucket: String,
    /// Key prefixes in order of preference.
    pub keys: Vec<String>,
    /// Directory to restore into; created if missing.
    pub dir: PathBuf,
}

impl RestoreRequest {
    pub fn new(bucket: impl Into<String>, keys: Vec<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
            keys,
            dir: dir.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(Error::InvalidArgument("missing bucket".into()));
        }
        if self.dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("missing directory".into()));
        }
        if self.keys.is_empty() {
            return Err(Error::InvalidArgument(
                "expected at least one cache key".into(),
            ));
        }
        Ok(())
    }
}

/// Result of a save. Every variant is a success.
#[derive(Debug, Clone)]
pub enum SaveOutcome {
    /// The archive was uploaded and committed.
    Uploaded {
        object: CacheObject,
        stats: ArchiveStats,
    },
    /// An object already existed under the key; nothing was uploaded.
    AlreadyCached,
    /// Another writer created the key while this one was uploading.
    RaceLost,
}

/// Result of a restore.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    /// The object that was restored.
    pub object: CacheObject,
    /// Whether the object name equals one of the requested keys.
    pub exact_match: bool,
    pub stats: ArchiveStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarstash_core::ErrorKind;

    #[test]
    fn test_save_request_validation() {
        assert!(SaveRequest::new("b", "k", "d").validate().is_ok());
        for req in [
            SaveRequest::new("", "k", "d"),
            SaveRequest::new("b", "", "d"),
            SaveRequest::new("b", "k", ""),
        ] {
            assert_eq!(
                req.validate().unwrap_err().kind(),
                ErrorKind::InvalidArgument
            );
        }
    }

    #[test]
    fn test_restore_request_validation() {
        assert!(
            RestoreRequest::new("b", vec!["k".into()], "d")
                .validate()
                .is_ok()
        );
        let err = RestoreRequest::new("b", vec![], "d").validate().unwrap_err();
        assert_eq!(err.to_string(), "invalid argument: expected at least one cache key");
        assert!(RestoreRequest::new("", vec!["k".into()], "d").validate().is_err());
        assert!(RestoreRequest::new("b", vec!["k".into()], "").validate().is_err());
    }
}
