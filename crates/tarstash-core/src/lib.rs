//! tarstash core
//!
//! Shared vocabulary for the tarstash crates: the error type, cache object
//! metadata, and the object store ports that storage adapters implement.
//! This crate has minimal dependencies so adapters can depend on it freely.

pub mod cancel;
pub mod error;
pub mod ids;
pub mod object;
pub mod ports;

pub use cancel::{CancelIo, cancellable};
pub use error::{Error, ErrorKind, Result, ResultExt, combine_release};
pub use ids::*;
pub use object::{CacheObject, ObjectAttrs};
pub use ports::{ObjectReader, ObjectStore, ObjectStream, ObjectWriter};
