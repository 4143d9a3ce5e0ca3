//! Cache directory watcher.
//!
//! Walks the nginx cache tree once, then follows filesystem notifications to
//! keep an [`EntryStore`] in step with the regular files on disk. Every
//! first insertion emits [`ChangeEvent::Added`], every deletion of a tracked
//! key emits [`ChangeEvent::Removed`].
//!
//! # Event handling
//!
//! A notification names paths and says whether they were created, removed
//! or changed. Each path is re-examined on disk and the store is brought in
//! line with what is found there (directory → watched, regular file →
//! upserted, missing → forgotten). A removal of a watched directory always
//! drops its registration, since a directory recreated under the same name
//! needs a fresh watch. Paths are routed to a fixed pool of workers by the
//! hash of their entry key, so operations on one key are applied in
//! notification order while unrelated keys proceed in parallel. Files found
//! while walking a new directory go through the same routing.

use std::collections::hash_map::DefaultHasher;
use std::fs::Metadata;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use peercache_core::{
    entry_key, CacheEntry, ChangeEvent, ConfigError, EntryKey, EventOutlet, EventReceiver,
    EventSender, PeerCacheResult, ShutdownSignal, Timestamp, WatchError,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::store::{EntryStore, Upsert};

/// Default number of event workers.
pub const DEFAULT_WATCH_WORKERS: usize = 4;

// ============================================================================
// WATCHER
// ============================================================================

pub struct CacheWatcher {
    root: PathBuf,
    workers: usize,
    store: Arc<EntryStore>,
    events: EventOutlet<ChangeEvent>,
}

impl CacheWatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            workers: DEFAULT_WATCH_WORKERS,
            store: Arc::new(EntryStore::new()),
            events: EventOutlet::new(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared handle to the live entry store.
    pub fn store(&self) -> Arc<EntryStore> {
        Arc::clone(&self.store)
    }

    pub fn keys(&self) -> Vec<EntryKey> {
        self.store.keys()
    }

    /// Hand out the event stream. Only the first call gets it.
    pub fn take_events(&self) -> Option<EventReceiver<ChangeEvent>> {
        self.events.take_receiver()
    }

    /// Run until `shutdown` fires or the event source fails.
    ///
    /// The event stream is closed on every exit path.
    pub async fn watch(&self, shutdown: ShutdownSignal) -> PeerCacheResult<()> {
        let result = self.run(shutdown).await;
        self.events.close();
        result
    }

    async fn run(&self, mut shutdown: ShutdownSignal) -> PeerCacheResult<()> {
        if shutdown.is_triggered() {
            return Ok(());
        }

        let root = validate_root(&self.root)?;

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();
        let source = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = raw_tx.send(res);
        })
        .map_err(|e| WatchError::SourceUnavailable {
            reason: e.to_string(),
        })?;

        let ctx = SyncContext {
            store: Arc::clone(&self.store),
            registry: Arc::new(DirRegistry::new(source)),
            events: self.events.sender(),
        };

        info!(root = ?root, workers = self.workers, "Starting cache watcher");

        // No worker runs yet, so the initial walk may upsert directly.
        let sync_ctx = ctx.clone();
        let sync_root = root.clone();
        let files = tokio::task::spawn_blocking(move || {
            sync_tree(&sync_ctx, &sync_root, &FileSink::Inline)
        })
        .await
        .map_err(|e| WatchError::TaskFailed {
            reason: e.to_string(),
        })??;

        info!(files, entries = self.store.len(), "Initial cache sync finished");

        let dispatcher = Dispatcher::spawn(self.workers, ctx);

        loop {
            tokio::select! {
                _ = shutdown.triggered() => {
                    info!("Shutdown requested, finishing cache watcher");
                    break;
                }
                received = raw_rx.recv() => match received {
                    Some(Ok(event)) => {
                        for notice in notices(event) {
                            dispatcher.dispatch(notice);
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "Filesystem event source reported an error");
                    }
                    None => {
                        dispatcher.stop().await;
                        return Err(WatchError::SourceClosed.into());
                    }
                }
            }
        }

        dispatcher.stop().await;
        Ok(())
    }
}

fn validate_root(root: &Path) -> Result<PathBuf, ConfigError> {
    let not_a_directory = || ConfigError::NotADirectory {
        path: root.to_path_buf(),
    };

    match std::fs::metadata(root) {
        Ok(metadata) if metadata.is_dir() => root.canonicalize().map_err(|_| not_a_directory()),
        _ => Err(not_a_directory()),
    }
}

// ============================================================================
// NOTICES
// ============================================================================

/// What a notification said happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NoticeKind {
    Created,
    Removed,
    Changed,
}

/// A path to re-examine.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Notice {
    path: PathBuf,
    kind: NoticeKind,
}

impl Notice {
    fn new(path: PathBuf, kind: NoticeKind) -> Self {
        Self { path, kind }
    }
}

/// Paths worth re-examining for a notification.
fn notices(event: notify::Event) -> Vec<Notice> {
    let kind = match event.kind {
        EventKind::Access(_) | EventKind::Other => return Vec::new(),
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            NoticeKind::Created
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            NoticeKind::Removed
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // paths are [from, to]
            let mut paths = event.paths.into_iter();
            let from = paths.next().map(|path| Notice::new(path, NoticeKind::Removed));
            return from
                .into_iter()
                .chain(paths.map(|path| Notice::new(path, NoticeKind::Created)))
                .collect();
        }
        _ => NoticeKind::Changed,
    };

    event
        .paths
        .into_iter()
        .map(|path| Notice::new(path, kind))
        .collect()
}

// ============================================================================
// DIRECTORY REGISTRY
// ============================================================================

type DirId = (u64, u64);

/// Device and inode of a directory, where the platform exposes them.
#[cfg(unix)]
fn dir_id(metadata: &Metadata) -> Option<DirId> {
    use std::os::unix::fs::MetadataExt;
    Some((metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn dir_id(_metadata: &Metadata) -> Option<DirId> {
    None
}

/// How a directory on disk relates to its registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    Missing,
    Current,
    /// Registered for a different directory that used to live at the path.
    Stale,
    /// Registered, but identities are not available to compare.
    Unknown,
}

/// Directories currently registered with the event source.
struct DirRegistry {
    source: Mutex<RecommendedWatcher>,
    dirs: DashMap<PathBuf, Option<DirId>>,
}

impl DirRegistry {
    fn new(source: RecommendedWatcher) -> Self {
        Self {
            source: Mutex::new(source),
            dirs: DashMap::new(),
        }
    }

    fn is_registered(&self, dir: &Path) -> bool {
        self.dirs.contains_key(dir)
    }

    fn registration(&self, dir: &Path, metadata: &Metadata) -> Registration {
        let Some(registered) = self.dirs.get(dir).map(|id| *id) else {
            return Registration::Missing;
        };
        match (registered, dir_id(metadata)) {
            (Some(registered), Some(on_disk)) if registered == on_disk => Registration::Current,
            (Some(_), Some(_)) => Registration::Stale,
            _ => Registration::Unknown,
        }
    }

    /// Watch `dir` unless it is already watched for the directory on disk.
    fn register(&self, dir: &Path) -> Result<(), WatchError> {
        let failed = |reason: String| WatchError::RegisterFailed {
            path: dir.to_path_buf(),
            reason,
        };

        let metadata = std::fs::metadata(dir).map_err(|e| failed(e.to_string()))?;
        if self.registration(dir, &metadata) == Registration::Current {
            return Ok(());
        }

        let mut source = self.source.lock().map_err(|_| WatchError::LockPoisoned)?;
        source
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| failed(e.to_string()))?;
        drop(source);

        self.dirs.insert(dir.to_path_buf(), dir_id(&metadata));
        Ok(())
    }

    /// Unregister `dir` and everything below it.
    fn unregister_tree(&self, dir: &Path) {
        let doomed: Vec<PathBuf> = self
            .dirs
            .iter()
            .filter(|registered| registered.key().starts_with(dir))
            .map(|registered| registered.key().clone())
            .collect();

        for path in doomed {
            self.dirs.remove(&path);
            let Ok(mut source) = self.source.lock() else {
                continue;
            };
            // inotify drops the watch on its own when the directory goes away.
            if let Err(err) = source.unwatch(&path) {
                trace!(path = ?path, error = %err, "Unwatch failed");
            }
        }
    }
}

// ============================================================================
// SYNC CONTEXT
// ============================================================================

#[derive(Clone)]
struct SyncContext {
    store: Arc<EntryStore>,
    registry: Arc<DirRegistry>,
    events: EventSender<ChangeEvent>,
}

impl SyncContext {
    fn upsert_file(&self, path: &Path, metadata: &Metadata) {
        let modified_at: Timestamp = metadata
            .modified()
            .map(Timestamp::from)
            .unwrap_or_else(|_| Utc::now());

        let Some(entry) = CacheEntry::from_path(path, modified_at) else {
            debug!(path = ?path, "Skipping file without a usable name");
            return;
        };

        let key = entry.id.clone();
        if self.store.upsert(entry) == Upsert::Inserted {
            trace!(key = %key, "Cache entry added");
            self.events.send(ChangeEvent::Added(key));
        }
    }

    /// Drop a watched directory and every entry below it.
    fn forget_dir(&self, dir: &Path) {
        self.registry.unregister_tree(dir);
        for entry in self.store.remove_under(dir) {
            trace!(key = %entry.id, "Cache entry removed with its directory");
            self.events.send(ChangeEvent::Removed(entry.id));
        }
    }

    /// Drop whatever `path` used to be.
    fn forget(&self, path: &Path) {
        if self.registry.is_registered(path) {
            self.forget_dir(path);
            return;
        }

        let Some(key) = entry_key(path) else {
            return;
        };
        if self.store.remove_if_path(&key, path).is_some() {
            trace!(key = %key, "Cache entry removed");
            self.events.send(ChangeEvent::Removed(key));
        }
    }

    /// Bring the store in line with what the noticed path is on disk now.
    async fn apply(&self, notice: Notice, router: &Router) {
        let Notice { path, kind } = notice;

        if kind == NoticeKind::Removed && self.registry.is_registered(&path) {
            debug!(dir = ?path, "Watched directory removed");
            self.forget_dir(&path);
        }

        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => {
                match self.registry.registration(&path, &metadata) {
                    Registration::Current => return,
                    Registration::Unknown if kind == NoticeKind::Changed => return,
                    Registration::Missing => {}
                    Registration::Stale | Registration::Unknown => {
                        debug!(dir = ?path, "Directory was replaced, watching it again");
                        self.forget_dir(&path);
                    }
                }
                self.follow_dir(path, router).await;
            }
            Ok(metadata) if metadata.is_file() => {
                if self.registry.is_registered(&path) {
                    self.forget_dir(&path);
                }
                self.upsert_file(&path, &metadata);
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => self.forget(&path),
            Err(err) => warn!(path = ?path, error = %err, "Failed to stat cache path"),
        }
    }

    /// Watch a directory that appeared after startup.
    async fn follow_dir(&self, dir: PathBuf, router: &Router) {
        let ctx = self.clone();
        let sink = FileSink::Route(router.clone());
        let walked = dir.clone();
        match tokio::task::spawn_blocking(move || sync_tree(&ctx, &walked, &sink)).await {
            Ok(Ok(files)) => debug!(dir = ?dir, files, "Watching new directory"),
            Ok(Err(err)) => warn!(dir = ?dir, error = %err, "Failed to watch new directory"),
            Err(err) => warn!(dir = ?dir, error = %err, "Directory sync task failed"),
        }
    }
}

/// Where a directory walk sends the regular files it finds.
enum FileSink {
    /// Upsert on the walking thread.
    Inline,
    /// Hand each file to the worker that owns its key.
    Route(Router),
}

/// Register `root` and every directory below it, passing regular files to
/// `sink`.
///
/// For the initial walk ([`FileSink::Inline`]), failing to register or read
/// `root` itself is an error; anything below `root` is logged and skipped.
/// Returns the number of regular files seen.
fn sync_tree(ctx: &SyncContext, root: &Path, sink: &FileSink) -> Result<usize, WatchError> {
    let strict = matches!(sink, FileSink::Inline);
    ctx.registry.register(root)?;

    let mut files = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if strict && dir == root => {
                return Err(WatchError::ReadDirFailed {
                    path: dir,
                    reason: err.to_string(),
                });
            }
            Err(err) => {
                warn!(dir = ?dir, error = %err, "Failed to read cache directory, skipping");
                continue;
            }
        };

        for item in entries {
            let item = match item {
                Ok(item) => item,
                Err(err) => {
                    warn!(dir = ?dir, error = %err, "Failed to read directory entry, skipping");
                    continue;
                }
            };

            let path = item.path();
            let file_type = match item.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    warn!(path = ?path, error = %err, "Failed to stat cache path, skipping");
                    continue;
                }
            };

            if file_type.is_dir() {
                match ctx.registry.register(&path) {
                    Ok(()) => pending.push(path),
                    Err(err) => warn!(error = %err, "Failed to watch cache subdirectory, skipping"),
                }
            } else if file_type.is_file() {
                match sink {
                    FileSink::Inline => match item.metadata() {
                        Ok(metadata) => {
                            ctx.upsert_file(&path, &metadata);
                            files += 1;
                        }
                        Err(err) => warn!(path = ?path, error = %err, "Failed to stat cache file, skipping"),
                    },
                    FileSink::Route(router) => {
                        router.route(Notice::new(path, NoticeKind::Created));
                        files += 1;
                    }
                }
            }
        }
    }

    Ok(files)
}

// ============================================================================
// DISPATCH
// ============================================================================

/// One queue per worker; a path always goes to the queue of its key.
#[derive(Clone)]
struct Router {
    queues: Arc<[mpsc::UnboundedSender<Notice>]>,
}

impl Router {
    fn route(&self, notice: Notice) {
        let shard = shard_for(&notice.path, self.queues.len());
        if self.queues[shard].send(notice).is_err() {
            debug!(shard, "Watcher worker is gone, dropping notification");
        }
    }
}

/// Fixed pool of workers, selected by key hash.
struct Dispatcher {
    router: Router,
    handles: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    fn spawn(workers: usize, ctx: SyncContext) -> Self {
        let (queues, receivers): (Vec<_>, Vec<_>) = (0..workers.max(1))
            .map(|_| mpsc::unbounded_channel::<Notice>())
            .unzip();
        let router = Router {
            queues: queues.into(),
        };

        let handles = receivers
            .into_iter()
            .map(|mut rx| {
                let ctx = ctx.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    while let Some(notice) = rx.recv().await {
                        ctx.apply(notice, &router).await;
                    }
                })
            })
            .collect();

        Self { router, handles }
    }

    fn dispatch(&self, notice: Notice) {
        self.router.route(notice);
    }

    async fn stop(self) {
        // Workers hold router clones, so their queues never close on their own.
        drop(self.router);
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Worker index for `path`; equal entry keys always land on the same worker.
fn shard_for(path: &Path, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    match entry_key(path) {
        Some(key) => key.hash(&mut hasher),
        None => path.hash(&mut hasher),
    }
    (hasher.finish() % shards.max(1) as u64) as usize
}
