//! The string intern table.
//!
//! Every string lives here exactly once, so string equality is handle
//! equality. Entries are removed when the sweeper frees the string.

use std::hash::{BuildHasher, Hash, Hasher};

use rustc_hash::{FxBuildHasher, FxHashMap};

use crate::object::Object;

#[derive(Debug, Default)]
pub(crate) struct StringTable {
    buckets: FxHashMap<u64, Vec<u32>>,
    count: usize,
}

impl StringTable {
    pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
        let mut hasher = FxBuildHasher.build_hasher();
        bytes.hash(&mut hasher);
        hasher.finish()
    }

    /// Slot of the interned string equal to `bytes`, if any.
    pub(crate) fn find(&self, objects: &[Option<Object>], bytes: &[u8], hash: u64) -> Option<u32> {
        self.buckets.get(&hash)?.iter().copied().find(|&idx| {
            matches!(
                &objects[idx as usize],
                Some(Object::String(s)) if s.bytes.as_slice() == bytes
            )
        })
    }

    pub(crate) fn insert(&mut self, hash: u64, index: u32) {
        self.buckets.entry(hash).or_default().push(index);
        self.count += 1;
    }

    pub(crate) fn remove(&mut self, hash: u64, index: u32) {
        let Some(bucket) = self.buckets.get_mut(&hash) else {
            return;
        };
        if let Some(pos) = bucket.iter().position(|&i| i == index) {
            bucket.swap_remove(pos);
            self.count -= 1;
        }
        if bucket.is_empty() {
            self.buckets.remove(&hash);
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.count
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.buckets.capacity()
    }

    /// Releases bucket storage once the table is mostly empty.
    pub(crate) fn check_size(&mut self) {
        if self.buckets.len() < self.buckets.capacity() / 4 {
            self.buckets.shrink_to_fit();
        }
    }
}
