//! Ordered, closable event streams.
//!
//! Every producing component (cache watcher, service discoverer) owns an
//! [`EventSender`] created at construction time and hands the matching
//! [`EventReceiver`] to exactly one consumer. Closing is explicit and
//! idempotent: once closed, further sends are rejected and the receiver
//! yields the events already buffered before reporting end-of-stream.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A membership change for a keyed set (cache keys, peer addresses).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "lowercase")]
pub enum ChangeEvent {
    Added(String),
    Removed(String),
}

impl ChangeEvent {
    pub fn key(&self) -> &str {
        match self {
            ChangeEvent::Added(key) | ChangeEvent::Removed(key) => key,
        }
    }

    pub fn is_added(&self) -> bool {
        matches!(self, ChangeEvent::Added(_))
    }

    /// Label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Added(_) => "added",
            ChangeEvent::Removed(_) => "removed",
        }
    }
}

/// Create a connected sender/receiver pair.
pub fn event_stream<T>() -> (EventSender<T>, EventReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSender {
            inner: Arc::new(Mutex::new(Some(tx))),
        },
        EventReceiver { rx },
    )
}

/// Producer half of an event stream. Cloning shares the same stream.
#[derive(Debug)]
pub struct EventSender<T> {
    inner: Arc<Mutex<Option<mpsc::UnboundedSender<T>>>>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> EventSender<T> {
    /// Push an event. Returns false if the stream is closed or the
    /// receiver has been dropped.
    pub fn send(&self, event: T) -> bool {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Mark the end of the stream. Safe to call any number of times.
    pub fn close(&self) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take();
    }

    pub fn is_closed(&self) -> bool {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// A component's event stream: the producer half plus the consumer half,
/// held until a caller takes it.
#[derive(Debug)]
pub struct EventOutlet<T> {
    sender: EventSender<T>,
    receiver: Mutex<Option<EventReceiver<T>>>,
}

impl<T> Default for EventOutlet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventOutlet<T> {
    pub fn new() -> Self {
        let (sender, receiver) = event_stream();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub fn sender(&self) -> EventSender<T> {
        self.sender.clone()
    }

    pub fn send(&self, event: T) -> bool {
        self.sender.send(event)
    }

    pub fn close(&self) {
        self.sender.close();
    }

    /// Hand out the consumer half. Only the first call gets it.
    pub fn take_receiver(&self) -> Option<EventReceiver<T>> {
        match self.receiver.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Consumer half of an event stream.
#[derive(Debug)]
pub struct EventReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> EventReceiver<T> {
    /// Next event, or `None` once the stream is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` when nothing is
    /// buffered right now (or the stream has ended).
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
