//! Synchronous fan-out of events to subscriber callbacks.
//!
//! Each event kind has its own [`Topic`]. Subscribers are called in
//! registration order on the publishing thread. A subscriber that returns an
//! error or panics is logged and skipped; the rest still receive the event.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{CommitEvent, ErrorEvent, FileChangeEvent, WatchedSource};

/// Handle returned by every subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A subscriber callback.
pub type Subscriber<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Ordered subscriber list for one event kind.
pub struct Topic<T> {
    name: &'static str,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber<T>)>>,
}

impl<T> fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("subscribers", &self.len())
            .finish()
    }
}

impl<T> Topic<T> {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, id: SubscriptionId, subscriber: Subscriber<T>) {
        self.lock().push((id, subscriber));
    }

    /// Returns `true` if `id` was subscribed to this topic.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        subscribers.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every subscriber, returning how many succeeded.
    ///
    /// The subscriber list is copied before delivery, so callbacks may
    /// subscribe or unsubscribe without deadlocking.
    pub fn publish(&self, event: &T) -> usize {
        let subscribers: Vec<(SubscriptionId, Subscriber<T>)> = self.lock().clone();
        let mut delivered = 0;

        for (id, subscriber) in subscribers {
            match panic::catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(
                        topic = self.name,
                        subscription = %id,
                        error = %e,
                        "Subscriber failed"
                    );
                }
                Err(payload) => {
                    warn!(
                        topic = self.name,
                        subscription = %id,
                        panic = %panic_message(payload.as_ref()),
                        "Subscriber panicked"
                    );
                }
            }
        }

        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Subscriber<T>)>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// All notification topics of a monitor.
#[derive(Debug)]
pub struct Broadcaster {
    next_id: AtomicU64,
    pub file_changes: Topic<FileChangeEvent>,
    pub commits: Topic<CommitEvent>,
    pub errors: Topic<ErrorEvent>,
    pub source_added: Topic<WatchedSource>,
    pub source_removed: Topic<WatchedSource>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            file_changes: Topic::new("file_change"),
            commits: Topic::new("commit"),
            errors: Topic::new("error"),
            source_added: Topic::new("source_added"),
            source_removed: Topic::new("source_removed"),
        }
    }

    /// Subscribes `callback` to `topic` under a fresh id.
    pub fn subscribe<T, F>(&self, topic: &Topic<T>, callback: F) -> SubscriptionId
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        topic.subscribe(id, Arc::new(callback));
        id
    }

    /// Removes a subscription from whichever topic holds it.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.file_changes.unsubscribe(id)
            || self.commits.unsubscribe(id)
            || self.errors.unsubscribe(id)
            || self.source_added.unsubscribe(id)
            || self.source_removed.unsubscribe(id)
    }
}
