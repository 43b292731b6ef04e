//! Restore-time key resolution.

use futures::StreamExt;
use tarstash_core::{CacheObject, Error, ObjectStore, Result, ResultExt, cancellable};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Finds the newest object whose name starts with any of the given keys.
///
/// Every key is searched, not only the first one with a hit, and the most
/// recently updated object wins across all of them. On equal timestamps the
/// object seen first is kept; since the store decides listing order, ties
/// between equally fresh objects are not resolved deterministically.
pub struct KeyResolver<'a> {
    store: &'a dyn ObjectStore,
    debug: bool,
}

impl<'a> KeyResolver<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self {
            store,
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub async fn resolve(
        &self,
        bucket: &str,
        keys: &[String],
        cancel: &CancellationToken,
    ) -> Result<CacheObject> {
        let mut best: Option<CacheObject> = None;

        for key in keys {
            if self.debug {
                debug!(prefix = %key, "searching for objects");
            }
            let mut objects = cancellable(cancel, self.store.list(bucket, key))
                .await
                .with_context(|| format!("failed to list {}", key))?;

            loop {
                let next = cancellable(cancel, async { Ok(objects.next().await) }).await?;
                let Some(object) = next else { break };
                let object = object.with_context(|| format!("failed to list {}", key))?;

                if self.debug {
                    debug!(object = %object.name, "found object");
                }
                if is_better(best.as_ref(), &object) {
                    if self.debug {
                        debug!(object = %object.name, "setting as best candidate");
                    }
                    best = Some(object);
                }
            }
        }

        best.ok_or_else(|| Error::NoMatchingObject {
            keys: keys.to_vec(),
        })
    }
}

/// Strictly newer replaces; ties keep the current candidate.
fn is_better(current: Option<&CacheObject>, candidate: &CacheObject) -> bool {
    current.is_none_or(|best| candidate.updated_at > best.updated_at)
}
