use std::collections::HashSet;

use crate::error::HoardError;
use crate::object_store::ObjectStore;

/// Keys present under a prefix at snapshot time. Never refreshed: uploads
/// made later in the same run are tracked by the caller.
#[derive(Debug, Clone, Default)]
pub struct RemoteIndex {
    prefix: String,
    keys: HashSet<String>,
}

impl RemoteIndex {
    /// Single listing pass. A failure here aborts the run since every dedup
    /// decision depends on it.
    pub fn snapshot<O: ObjectStore + ?Sized>(
        store: &O,
        bucket: &str,
        prefix: &str,
    ) -> Result<Self, HoardError> {
        tracing::info!(bucket, prefix, "reading existing objects");
        let keys = store.list(bucket, prefix)?;
        tracing::info!(count = keys.len(), "existing objects read");
        Ok(Self::from_keys(prefix, keys))
    }

    pub fn from_keys<I, K>(prefix: &str, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            prefix: prefix.to_string(),
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
