//! In-memory peer transport for sidecar integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use peercache_core::{DialError, EntrySummary, RpcError, RpcErrorKind};
use peercache_sidecar::{PeerClient, PeerDialer};
use tokio::time::Instant;

/// Shared behaviour and observations of the fake network.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    fail_always: Mutex<HashSet<String>>,
    fail_times: Mutex<HashMap<String, u32>>,
    dial_delay: Mutex<Duration>,
    attempts: Mutex<Vec<(String, Instant)>>,
    closed: Mutex<Vec<String>>,
    inventories: Mutex<HashMap<String, Result<Vec<EntrySummary>, RpcError>>>,
    list_delay: Mutex<Duration>,
    list_calls: AtomicUsize,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dialer(self: &Arc<Self>) -> FakeDialer {
        FakeDialer {
            net: Arc::clone(self),
        }
    }

    pub fn fail_always(&self, address: &str) {
        self.fail_always.lock().unwrap().insert(address.to_string());
    }

    /// Fail the next `times` dials to `address`.
    pub fn fail_times(&self, address: &str, times: u32) {
        self.fail_times
            .lock()
            .unwrap()
            .insert(address.to_string(), times);
    }

    pub fn set_dial_delay(&self, delay: Duration) {
        *self.dial_delay.lock().unwrap() = delay;
    }

    pub fn set_inventory(&self, address: &str, response: Result<Vec<EntrySummary>, RpcError>) {
        self.inventories
            .lock()
            .unwrap()
            .insert(address.to_string(), response);
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = delay;
    }

    pub fn attempts_for(&self, address: &str) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn closed(&self) -> Vec<String> {
        let mut closed = self.closed.lock().unwrap().clone();
        closed.sort();
        closed
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct FakeDialer {
    net: Arc<FakeNetwork>,
}

#[async_trait]
impl PeerDialer for FakeDialer {
    type Client = FakeClient;

    async fn dial(&self, address: &str) -> Result<FakeClient, DialError> {
        self.net
            .attempts
            .lock()
            .unwrap()
            .push((address.to_string(), Instant::now()));

        let delay = *self.net.dial_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let refused = || DialError::ConnectFailed {
            address: address.to_string(),
            reason: "connection refused".to_string(),
        };
        if self.net.fail_always.lock().unwrap().contains(address) {
            return Err(refused());
        }
        {
            let mut fail_times = self.net.fail_times.lock().unwrap();
            if let Some(remaining) = fail_times.get_mut(address) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(refused());
                }
            }
        }

        Ok(FakeClient {
            address: address.to_string(),
            net: Arc::clone(&self.net),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FakeClient {
    address: String,
    net: Arc<FakeNetwork>,
}

#[async_trait]
impl PeerClient for FakeClient {
    async fn list(&self) -> Result<Vec<EntrySummary>, RpcError> {
        self.net.list_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.net.list_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.net
            .inventories
            .lock()
            .unwrap()
            .get(&self.address)
            .cloned()
            .unwrap_or_else(|| {
                Err(RpcError::new(
                    "List",
                    RpcErrorKind::Unimplemented,
                    "method List not implemented",
                ))
            })
    }

    async fn close(self) {
        self.net.closed.lock().unwrap().push(self.address.clone());
    }
}
