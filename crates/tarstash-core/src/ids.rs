//! Strongly-typed identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0.simple())
            }
        }
    };
}

// Staged uploads are named by this id until they are committed.
define_id!(UploadId, "upl");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_id_display_is_path_safe() {
        let id = UploadId::new();
        let s = id.to_string();
        assert!(s.starts_with("upl_"));
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn test_upload_ids_are_unique() {
        assert_ne!(UploadId::new(), UploadId::new());
    }
}
