//! Concurrent cache entry store.
//!
//! Backed by a sharded `DashMap`, so readers (`keys`, `snapshot`) never block
//! on writers touching unrelated keys, and every insert/remove on one key is
//! atomic with respect to other operations on that key.

use std::path::Path;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use peercache_core::{CacheEntry, EntryKey, EntrySummary};

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// The key was not present before.
    Inserted,
    /// The key existed and its entry was replaced.
    Updated,
}

#[derive(Debug, Default)]
pub struct EntryStore {
    entries: DashMap<EntryKey, CacheEntry>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry under its id.
    pub fn upsert(&self, entry: CacheEntry) -> Upsert {
        match self.entries.insert(entry.id.clone(), entry) {
            None => Upsert::Inserted,
            Some(_) => Upsert::Updated,
        }
    }

    /// Remove `key` only if it is currently backed by `path`.
    ///
    /// Two files with the same name in different subdirectories share a key;
    /// deleting one of them must not drop the entry tracking the other.
    pub fn remove_if_path(&self, key: &str, path: &Path) -> Option<CacheEntry> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().path == path => Some(occupied.remove()),
            _ => None,
        }
    }

    /// Remove every entry whose file lives under `dir`.
    pub fn remove_under(&self, dir: &Path) -> Vec<CacheEntry> {
        let doomed: Vec<(EntryKey, std::path::PathBuf)> = self
            .entries
            .iter()
            .filter(|entry| entry.value().path.starts_with(dir))
            .map(|entry| (entry.key().clone(), entry.value().path.clone()))
            .collect();

        doomed
            .into_iter()
            .filter_map(|(key, path)| self.remove_if_path(&key, &path))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<EntryKey> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Point-in-time copy of every entry, sorted by id.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> =
            self.entries.iter().map(|entry| entry.value().clone()).collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Wire-level view of [`snapshot`](Self::snapshot).
    pub fn summaries(&self) -> Vec<EntrySummary> {
        self.snapshot().iter().map(CacheEntry::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
