//! Cache object metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cache-control hint written on every saved object. Objects never change
/// once created, but callers may still want to revalidate after a while.
pub const DEFAULT_CACHE_CONTROL: &str = "public,max-age=600";

/// A saved cache archive as seen in the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheObject {
    /// Bucket holding the object.
    pub bucket: String,
    /// Object name, equal to the cache key it was saved under.
    pub name: String,
    /// When the object was created (objects are never rewritten).
    pub updated_at: DateTime<Utc>,
    /// Size of the stored archive in bytes.
    #[serde(default)]
    pub size: u64,
    /// Content type recorded at save time.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Cache-control hint recorded at save time.
    #[serde(default)]
    pub cache_control: Option<String>,
}

/// Attributes attached to an object when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectAttrs {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
}

impl ObjectAttrs {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            cache_control: Some(DEFAULT_CACHE_CONTROL.to_string()),
        }
    }

    pub fn with_cache_control(mut self, cache_control: impl Into<String>) -> Self {
        self.cache_control = Some(cache_control.into());
        self
    }
}
