//! Object store adapters.

pub mod filesystem;
pub mod memory;
pub mod s3;

pub use filesystem::FilesystemStore;
pub use memory::{Faults, MemoryStore};
pub use s3::S3Store;
