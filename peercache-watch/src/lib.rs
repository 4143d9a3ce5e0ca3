//! peercache Watch - Local Cache State
//!
//! Keeps a live, concurrency-safe view of the nginx cache directory:
//! [`EntryStore`] holds one [`peercache_core::CacheEntry`] per cached file and
//! [`CacheWatcher`] keeps it current from filesystem notifications, emitting
//! an ordered stream of added/removed keys.

pub mod store;
pub mod watcher;

pub use store::{EntryStore, Upsert};
pub use watcher::{CacheWatcher, DEFAULT_WATCH_WORKERS};
