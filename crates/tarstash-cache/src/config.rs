//! Configuration for the cacher.

use crate::compression::CompressionType;
use serde::{Deserialize, Serialize};
use tarstash_core::object::DEFAULT_CACHE_CONTROL;

/// Configuration for a [`crate::Cacher`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacherConfig {
    /// Log each protocol step at debug level.
    #[serde(default)]
    pub debug: bool,
    /// Compression applied when saving.
    #[serde(default)]
    pub compression: CompressionType,
    /// Codec-specific compression level; `None` uses the codec default.
    #[serde(default)]
    pub compression_level: Option<i32>,
    /// Cache-control hint written on saved objects.
    #[serde(default = "default_cache_control")]
    pub cache_control: String,
    /// Buffer between the archive stream and the store, in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_cache_control() -> String {
    DEFAULT_CACHE_CONTROL.to_string()
}

fn default_buffer_size() -> usize {
    1024 * 1024
}

impl Default for CacherConfig {
    fn default() -> Self {
        Self {
            debug: false,
            compression: CompressionType::default(),
            compression_level: None,
            cache_control: default_cache_control(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl CacherConfig {
    /// Enable or disable step logging.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the compression algorithm.
    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Set the compression level.
    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = Some(level);
        self
    }

    /// Set the cache-control hint.
    pub fn with_cache_control(mut self, cache_control: impl Into<String>) -> Self {
        self.cache_control = cache_control.into();
        self
    }

    /// Set the stream buffer size. Zero is bumped to one byte.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }
}
