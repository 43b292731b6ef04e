//! Build-artifact cache backed by an object store (S3/filesystem).
//!
//! A directory is saved as one compressed tar archive under a cache key and
//! later restored from the newest object matching one of several key
//! prefixes.

pub mod archiver;
pub mod cacher;
pub mod compression;
pub mod config;
pub mod keys;
pub mod resolver;
pub mod store;
pub mod types;

pub use archiver::{ArchiveEntry, ArchiveStats, EntryKind, create_archive, extract_archive};
pub use cacher::Cacher;
pub use compression::CompressionType;
pub use config::CacherConfig;
pub use keys::{expand_key, hash_files, hash_glob, matches_prefix};
pub use resolver::KeyResolver;
pub use store::{FilesystemStore, MemoryStore, S3Store};
pub use types::{RestoreOutcome, RestoreRequest, SaveOutcome, SaveRequest};
