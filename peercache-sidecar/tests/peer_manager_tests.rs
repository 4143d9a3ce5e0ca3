//! Peer connection manager and dial retry behaviour.

mod support;

use std::sync::Arc;
use std::time::Duration;

use peercache_core::{
    event_stream, shutdown_channel, ChangeEvent, DialError, EventSender, RetryPolicy,
    ShutdownTrigger,
};
use peercache_discovery::{DnsServiceDiscovery, ServiceDiscoverer};
use peercache_sidecar::{dial_with_retry, PeerConnectionManager, SidecarMetrics};
use peercache_test_utils::assertions::{added, removed, wait_until};
use peercache_test_utils::ScriptedResolver;
use support::{FakeDialer, FakeNetwork};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(30);

struct Running {
    manager: Arc<PeerConnectionManager<FakeDialer>>,
    events: EventSender<ChangeEvent>,
    trigger: ShutdownTrigger,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.trigger.trigger();
        self.handle.await.unwrap();
    }
}

fn metrics() -> Arc<SidecarMetrics> {
    Arc::new(SidecarMetrics::new().unwrap())
}

fn start(net: &Arc<FakeNetwork>, policy: RetryPolicy) -> Running {
    let manager = Arc::new(PeerConnectionManager::new(net.dialer(), policy, metrics()));
    let (events, rx) = event_stream();
    let (trigger, signal) = shutdown_channel();

    let handle = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run(rx, signal).await.unwrap() })
    };

    Running {
        manager,
        events,
        trigger,
        handle,
    }
}

#[tokio::test(start_paused = true)]
async fn test_dial_backoff_doubles_and_stops_after_last_attempt() {
    let net = FakeNetwork::new();
    net.fail_always("10.0.0.1");
    let policy = RetryPolicy::new(5, Duration::from_millis(100));
    let (_trigger, mut signal) = shutdown_channel();

    let start = Instant::now();
    let result = dial_with_retry(&net.dialer(), "10.0.0.1", &policy, &mut signal, &metrics()).await;

    match result {
        Err(DialError::Exhausted { attempts, .. }) => assert_eq!(attempts, 5),
        other => panic!("expected exhaustion, got {:?}", other.map(|_| ())),
    }

    let attempts = net.attempts_for("10.0.0.1");
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(800),
        ]
    );
    assert_eq!(start.elapsed(), Duration::from_millis(1500));
}

#[tokio::test(start_paused = true)]
async fn test_dial_succeeds_after_transient_failures() {
    let net = FakeNetwork::new();
    net.fail_times("10.0.0.1", 2);
    let policy = RetryPolicy::new(5, Duration::from_millis(100));
    let (_trigger, mut signal) = shutdown_channel();
    let metrics = metrics();

    let result = dial_with_retry(&net.dialer(), "10.0.0.1", &policy, &mut signal, &metrics).await;

    assert!(result.is_ok());
    assert_eq!(net.attempts_for("10.0.0.1").len(), 3);
    assert_eq!(metrics.dial_attempts_total.with_label_values(&["failure"]).get(), 2);
    assert_eq!(metrics.dial_attempts_total.with_label_values(&["success"]).get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_backoff() {
    let net = FakeNetwork::new();
    net.fail_always("10.0.0.1");
    let (trigger, mut signal) = shutdown_channel();

    let dialer = net.dialer();
    let handle = tokio::spawn(async move {
        let policy = RetryPolicy::new(20, Duration::from_secs(1));
        dial_with_retry(&dialer, "10.0.0.1", &policy, &mut signal, &metrics()).await
    });

    tokio::time::sleep(Duration::from_millis(1500)).await;
    trigger.trigger();

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(DialError::Cancelled { .. })));
    assert_eq!(net.attempts_for("10.0.0.1").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_add_dials_once() {
    let net = FakeNetwork::new();
    let running = start(&net, RetryPolicy::default());

    running.events.send(added("10.0.0.1"));
    running.events.send(added("10.0.0.1"));
    assert!(wait_until(WAIT, || running.manager.contains("10.0.0.1")).await);

    running.events.send(added("10.0.0.1"));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(net.attempts_for("10.0.0.1").len(), 1);
    assert_eq!(running.manager.len(), 1);
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_remove_while_dialing_leaves_nothing_behind() {
    let net = FakeNetwork::new();
    net.set_dial_delay(Duration::from_secs(1));
    let running = start(&net, RetryPolicy::default());

    running.events.send(added("10.0.0.1"));
    assert!(wait_until(WAIT, || running.manager.is_known("10.0.0.1")).await);
    assert!(!running.manager.contains("10.0.0.1"));

    running.events.send(removed("10.0.0.1"));
    assert!(wait_until(WAIT, || !running.manager.is_known("10.0.0.1")).await);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!running.manager.is_known("10.0.0.1"));
    assert!(running.manager.is_empty());
    assert!(net.closed().is_empty());
    assert_eq!(net.attempts_for("10.0.0.1").len(), 1);
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_flapping_peer_reconnects() {
    let net = FakeNetwork::new();
    let running = start(&net, RetryPolicy::default());

    running.events.send(added("10.0.0.1"));
    assert!(wait_until(WAIT, || running.manager.contains("10.0.0.1")).await);

    running.events.send(removed("10.0.0.1"));
    assert!(wait_until(WAIT, || net.closed() == vec!["10.0.0.1".to_string()]).await);
    assert!(!running.manager.is_known("10.0.0.1"));

    running.events.send(added("10.0.0.1"));
    assert!(wait_until(WAIT, || running.manager.contains("10.0.0.1")).await);

    assert_eq!(net.attempts_for("10.0.0.1").len(), 2);
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_removing_unknown_peer_is_harmless() {
    let net = FakeNetwork::new();
    let running = start(&net, RetryPolicy::default());

    running.events.send(removed("10.0.0.9"));
    running.events.send(added("10.0.0.1"));
    assert!(wait_until(WAIT, || running.manager.contains("10.0.0.1")).await);

    assert_eq!(running.manager.addresses(), vec!["10.0.0.1".to_string()]);
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_peer_is_forgotten_until_added_again() {
    let net = FakeNetwork::new();
    net.fail_times("10.0.0.1", 3);
    let running = start(&net, RetryPolicy::new(3, Duration::from_millis(100)));

    running.events.send(added("10.0.0.1"));
    assert!(
        wait_until(WAIT, || {
            net.attempts_for("10.0.0.1").len() == 3 && !running.manager.is_known("10.0.0.1")
        })
        .await
    );

    running.events.send(added("10.0.0.1"));
    assert!(wait_until(WAIT, || running.manager.contains("10.0.0.1")).await);
    assert_eq!(net.attempts_for("10.0.0.1").len(), 4);
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_peer_does_not_block_others() {
    let net = FakeNetwork::new();
    net.fail_always("10.0.0.1");
    let running = start(&net, RetryPolicy::default());

    running.events.send(added("10.0.0.1"));
    running.events.send(added("10.0.0.2"));
    assert!(wait_until(Duration::from_millis(500), || running.manager.contains("10.0.0.2")).await);

    assert!(running.manager.is_known("10.0.0.1"));
    assert!(!running.manager.contains("10.0.0.1"));
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_every_connection() {
    let net = FakeNetwork::new();
    net.fail_always("10.0.0.3");
    let running = start(&net, RetryPolicy::default());

    for address in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        running.events.send(added(address));
    }
    assert!(wait_until(WAIT, || running.manager.len() == 2).await);

    let manager = Arc::clone(&running.manager);
    running.stop().await;

    assert_eq!(net.closed(), vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
    assert!(manager.is_empty());
    assert!(!manager.is_known("10.0.0.3"));
}

#[tokio::test(start_paused = true)]
async fn test_dns_membership_drives_connections() {
    let net = FakeNetwork::new();
    let resolver = Arc::new(ScriptedResolver::from_answers(&[
        &["10.0.0.1", "10.0.0.2"],
        &["10.0.0.2", "10.0.0.3"],
    ]));
    let discovery =
        Arc::new(DnsServiceDiscovery::new("peers.test", resolver).with_interval(Duration::from_secs(1)));
    let manager = Arc::new(PeerConnectionManager::new(
        net.dialer(),
        RetryPolicy::default(),
        metrics(),
    ));

    let (trigger, signal) = shutdown_channel();
    let peer_events = discovery.take_events().unwrap();
    let discovering = {
        let discovery = Arc::clone(&discovery);
        let signal = signal.clone();
        tokio::spawn(async move { discovery.discover(signal).await })
    };
    let managing = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run(peer_events, signal).await })
    };

    assert!(
        wait_until(WAIT, || {
            manager.addresses() == vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()]
        })
        .await
    );
    assert_eq!(net.closed(), vec!["10.0.0.1".to_string()]);
    assert_eq!(net.attempts_for("10.0.0.2").len(), 1);

    trigger.trigger();
    discovering.await.unwrap().unwrap();
    managing.await.unwrap().unwrap();
    assert!(manager.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_manager_waits_for_shutdown_after_stream_ends() {
    let net = FakeNetwork::new();
    let running = start(&net, RetryPolicy::default());

    running.events.send(added("10.0.0.1"));
    assert!(wait_until(WAIT, || running.manager.contains("10.0.0.1")).await);
    running.events.close();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!running.handle.is_finished());
    assert!(running.manager.contains("10.0.0.1"));

    running.stop().await;
    assert_eq!(net.closed(), vec!["10.0.0.1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_second_poll_adds_exactly_one_connection() {
    let net = FakeNetwork::new();
    let resolver = Arc::new(ScriptedResolver::from_answers(&[
        &["10.0.0.1"],
        &["10.0.0.1", "10.0.0.2"],
    ]));
    let discovery = Arc::new(
        DnsServiceDiscovery::new("peers.test", Arc::clone(&resolver))
            .with_interval(Duration::from_secs(1)),
    );
    let manager = Arc::new(PeerConnectionManager::new(
        net.dialer(),
        RetryPolicy::default(),
        metrics(),
    ));

    let started = Instant::now();
    let (trigger, signal) = shutdown_channel();
    let peer_events = discovery.take_events().unwrap();
    let discovering = {
        let discovery = Arc::clone(&discovery);
        let signal = signal.clone();
        tokio::spawn(async move { discovery.discover(signal).await })
    };
    let managing = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run(peer_events, signal).await })
    };

    assert!(wait_until(WAIT, || manager.len() == 2).await);
    assert_eq!(
        manager.addresses(),
        vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]
    );
    assert!(resolver.lookups() >= 2);

    assert_eq!(net.attempts_for("10.0.0.1").len(), 1);
    let second = net.attempts_for("10.0.0.2");
    assert_eq!(second.len(), 1);
    assert!(second[0] >= started + Duration::from_secs(1));

    // Later polls repeat the same answer and change nothing.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(manager.len(), 2);
    assert_eq!(net.attempts_for("10.0.0.2").len(), 1);
    assert!(net.closed().is_empty());

    trigger.trigger();
    discovering.await.unwrap().unwrap();
    managing.await.unwrap().unwrap();
}
