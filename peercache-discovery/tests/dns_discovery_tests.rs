//! DNS discovery driven by a scripted resolver on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use peercache_core::{shutdown_channel, PeerCacheError};
use peercache_discovery::{DnsServiceDiscovery, ServiceDiscoverer};
use peercache_test_utils::assertions::{added, drain_events, expect_event, removed};
use peercache_test_utils::ScriptedResolver;

const WAIT: Duration = Duration::from_secs(30);

#[tokio::test(start_paused = true)]
async fn test_membership_change_adds_then_removes() {
    let resolver = Arc::new(ScriptedResolver::from_answers(&[
        &["10.0.0.1", "10.0.0.2"],
        &["10.0.0.2", "10.0.0.3"],
    ]));
    let discovery = Arc::new(DnsServiceDiscovery::new("peers.local", resolver.clone()));
    let mut events = discovery.take_events().unwrap();
    let (trigger, signal) = shutdown_channel();

    let runner = Arc::clone(&discovery);
    let task = tokio::spawn(async move { runner.discover(signal).await });

    assert_eq!(expect_event(&mut events, WAIT).await, added("10.0.0.1"));
    assert_eq!(expect_event(&mut events, WAIT).await, added("10.0.0.2"));
    assert_eq!(expect_event(&mut events, WAIT).await, added("10.0.0.3"));
    assert_eq!(expect_event(&mut events, WAIT).await, removed("10.0.0.1"));

    // Steady state: repeated answers publish nothing.
    assert!(drain_events(&mut events, Duration::from_secs(5)).await.is_empty());
    assert!(resolver.lookups() >= 3);

    trigger.trigger();
    task.await.unwrap().unwrap();
    assert_eq!(events.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_empty_answer_removes_every_peer() {
    let resolver = Arc::new(ScriptedResolver::from_answers(&[&["10.0.0.1", "10.0.0.2"], &[]]));
    let discovery = Arc::new(DnsServiceDiscovery::new("peers.local", resolver));
    let mut events = discovery.take_events().unwrap();
    let (trigger, signal) = shutdown_channel();

    let runner = Arc::clone(&discovery);
    let task = tokio::spawn(async move { runner.discover(signal).await });

    let mut seen = drain_events(&mut events, Duration::from_secs(5)).await;
    assert_eq!(seen.drain(..2).collect::<Vec<_>>(), vec![added("10.0.0.1"), added("10.0.0.2")]);
    seen.sort_by(|a, b| a.key().cmp(b.key()));
    assert_eq!(seen, vec![removed("10.0.0.1"), removed("10.0.0.2")]);

    trigger.trigger();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_errors_after_start_keep_tracked_set() {
    let resolver = Arc::new(ScriptedResolver::new(vec![
        Ok(vec!["10.0.0.1".parse().unwrap()]),
        ScriptedResolver::failure("peers.local"),
        ScriptedResolver::failure("peers.local"),
        Ok(vec!["10.0.0.1".parse().unwrap()]),
    ]));
    let discovery = Arc::new(DnsServiceDiscovery::new("peers.local", resolver.clone()));
    let mut events = discovery.take_events().unwrap();
    let (trigger, signal) = shutdown_channel();

    let runner = Arc::clone(&discovery);
    let task = tokio::spawn(async move { runner.discover(signal).await });

    assert_eq!(
        drain_events(&mut events, Duration::from_secs(10)).await,
        vec![added("10.0.0.1")]
    );
    assert!(resolver.lookups() >= 4);
    assert!(!task.is_finished());

    trigger.trigger();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_startup_error_fails_fast() {
    let resolver = Arc::new(ScriptedResolver::new(vec![ScriptedResolver::failure(
        "peers.local",
    )]));
    let discovery = DnsServiceDiscovery::new("peers.local", resolver);
    let mut events = discovery.take_events().unwrap();
    let (_trigger, signal) = shutdown_channel();

    let err = discovery.discover(signal).await.unwrap_err();
    assert!(matches!(err, PeerCacheError::Discovery(_)));
    assert_eq!(events.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_custom_interval_spaces_lookups() {
    let resolver = Arc::new(ScriptedResolver::from_answers(&[&["10.0.0.1"]]));
    let discovery = Arc::new(
        DnsServiceDiscovery::new("peers.local", resolver.clone())
            .with_interval(Duration::from_secs(10)),
    );
    let (trigger, signal) = shutdown_channel();

    let runner = Arc::clone(&discovery);
    let task = tokio::spawn(async move { runner.discover(signal).await });

    tokio::time::sleep(Duration::from_secs(25)).await;
    // startup lookup plus ticks at 10s and 20s
    assert_eq!(resolver.lookups(), 3);

    trigger.trigger();
    task.await.unwrap().unwrap();
}
