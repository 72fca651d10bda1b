use ahash::AHashSet;

use super::models::{IdentityKey, Record};

/// Identity keys already present in a manifest.
///
/// Deciding whether to skip an item is purely `(path, size, mtime_ns)`
/// equality; content is never re-hashed for it.
#[derive(Debug, Default, Clone)]
pub struct ResumeIndex {
    keys: AHashSet<IdentityKey>,
}

impl ResumeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        Self {
            keys: records.into_iter().map(Record::identity_key).collect(),
        }
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.keys.contains(key)
    }

    /// Returns `false` when the key was already known.
    pub fn insert(&mut self, key: IdentityKey) -> bool {
        self.keys.insert(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
