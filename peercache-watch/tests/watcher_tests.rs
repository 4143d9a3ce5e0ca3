//! Cache watcher against a real temporary directory.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use peercache_core::{shutdown_channel, ChangeEvent, EventReceiver, PeerCacheResult, ShutdownTrigger};
use peercache_test_utils::assertions::{added, drain_events, expect_event, removed, wait_until};
use peercache_test_utils::fixtures::TempCacheDir;
use peercache_watch::CacheWatcher;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(500);

struct Running {
    watcher: Arc<CacheWatcher>,
    events: EventReceiver<ChangeEvent>,
    trigger: ShutdownTrigger,
    task: JoinHandle<PeerCacheResult<()>>,
}

/// Start a watcher on `dir` (plus a seed file) and wait until the initial
/// sync has reported every pre-existing file. Returns the keys it reported.
async fn start(dir: &TempCacheDir, existing: usize) -> (Running, BTreeSet<String>) {
    dir.write_file("seed.cache", b"seed");

    let watcher = Arc::new(CacheWatcher::new(dir.path()).with_workers(2));
    let mut events = watcher.take_events().unwrap();
    let (trigger, signal) = shutdown_channel();

    let runner = Arc::clone(&watcher);
    let task = tokio::spawn(async move { runner.watch(signal).await });

    let mut initial = BTreeSet::new();
    for _ in 0..=existing {
        let event = expect_event(&mut events, WAIT).await;
        assert!(event.is_added());
        initial.insert(event.key().to_string());
    }

    let running = Running {
        watcher,
        events,
        trigger,
        task,
    };
    (running, initial)
}

async fn stop(mut running: Running) {
    running.trigger.trigger();
    running.task.await.unwrap().unwrap();
    drain_events(&mut running.events, QUIET).await;
    assert_eq!(running.events.recv().await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_added_then_removed() {
    let dir = TempCacheDir::new();
    let (mut running, _) = start(&dir, 0).await;

    dir.write_file("a.cache", b"payload");
    assert_eq!(expect_event(&mut running.events, WAIT).await, added("a"));
    assert!(running.watcher.keys().contains(&"a".to_string()));

    dir.remove_file("a.cache");
    assert_eq!(expect_event(&mut running.events, WAIT).await, removed("a"));

    assert!(drain_events(&mut running.events, QUIET).await.is_empty());
    assert_eq!(running.watcher.keys(), vec!["seed".to_string()]);

    stop(running).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rewrite_does_not_duplicate_added() {
    let dir = TempCacheDir::new();
    let (mut running, _) = start(&dir, 0).await;

    dir.write_file("a.cache", b"v1");
    assert_eq!(expect_event(&mut running.events, WAIT).await, added("a"));

    dir.write_file("a.cache", b"v2");
    dir.write_file("a.cache", b"v3");
    assert!(drain_events(&mut running.events, QUIET).await.is_empty());
    assert_eq!(running.watcher.store().len(), 2);

    stop(running).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initial_scan_covers_nested_levels() {
    let dir = TempCacheDir::new();
    dir.write_file("1/af/9b2c1e0d6f1a7e0c3b5d4a2f8e9c1af", b"x");
    dir.write_file("2/0c/77aa0c", b"y");

    let (mut running, initial) = start(&dir, 2).await;

    let expected = BTreeSet::from([
        "77aa0c".to_string(),
        "9b2c1e0d6f1a7e0c3b5d4a2f8e9c1af".to_string(),
        "seed".to_string(),
    ]);
    assert_eq!(initial, expected);
    assert_eq!(running.watcher.keys().into_iter().collect::<BTreeSet<_>>(), expected);
    assert!(drain_events(&mut running.events, QUIET).await.is_empty());

    stop(running).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_subdirectory_is_followed() {
    let dir = TempCacheDir::new();
    let (mut running, _) = start(&dir, 0).await;

    dir.create_dir("3/e1");
    dir.write_file("3/e1/b.cache", b"x");
    assert_eq!(expect_event(&mut running.events, WAIT).await, added("b"));

    // The new directory is registered: later files are seen too.
    dir.write_file("3/e1/c.cache", b"x");
    assert_eq!(expect_event(&mut running.events, WAIT).await, added("c"));

    stop(running).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removed_directory_drops_its_entries() {
    let dir = TempCacheDir::new();
    dir.write_file("4/x.cache", b"x");
    dir.write_file("4/y.cache", b"y");
    let (mut running, _) = start(&dir, 2).await;

    let watcher = Arc::clone(&running.watcher);
    assert!(wait_until(WAIT, || watcher.store().len() == 3).await);

    dir.remove_dir("4");

    let gone: BTreeSet<String> = drain_events(&mut running.events, Duration::from_secs(1))
        .await
        .into_iter()
        .map(|event| {
            assert!(!event.is_added());
            event.key().to_string()
        })
        .collect();
    assert_eq!(gone, BTreeSet::from(["x".to_string(), "y".to_string()]));
    assert_eq!(running.watcher.keys(), vec!["seed".to_string()]);

    stop(running).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recreated_directory_is_watched_again() {
    let dir = TempCacheDir::new();
    dir.write_file("d/f0.cache", b"x");
    let (mut running, _) = start(&dir, 1).await;

    for round in 1..=5 {
        let previous = format!("f{}", round - 1);
        let current = format!("f{}", round);

        dir.remove_dir("d");
        dir.create_dir("d");
        tokio::time::sleep(Duration::from_millis(200)).await;
        dir.write_file(&format!("d/{}.cache", current), b"y");

        let events = drain_events(&mut running.events, Duration::from_secs(1)).await;
        assert_eq!(events.len(), 2, "round {}: {:?}", round, events);
        assert!(events.contains(&removed(&previous)), "round {}: {:?}", round, events);
        assert!(events.contains(&added(&current)), "round {}: {:?}", round, events);
        assert_eq!(
            running.watcher.keys().into_iter().collect::<BTreeSet<_>>(),
            BTreeSet::from([current.clone(), "seed".to_string()]),
            "round {}",
            round
        );
    }

    stop(running).await;
}

#[tokio::test]
async fn test_missing_root_is_an_error() {
    let dir = TempCacheDir::new();
    let watcher = CacheWatcher::new(dir.path().join("missing"));
    let mut events = watcher.take_events().unwrap();
    let (_trigger, signal) = shutdown_channel();

    assert!(watcher.watch(signal).await.is_err());
    assert_eq!(events.recv().await, None);
}

#[tokio::test]
async fn test_shutdown_before_start_returns_ok() {
    let dir = TempCacheDir::new();
    let watcher = CacheWatcher::new(dir.path());
    let mut events = watcher.take_events().unwrap();
    let (trigger, signal) = shutdown_channel();
    trigger.trigger();

    watcher.watch(signal).await.unwrap();
    assert_eq!(events.recv().await, None);
    assert!(watcher.keys().is_empty());
}
