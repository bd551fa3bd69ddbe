//! Deduplicating work queue of workflow keys.
//!
//! A key is handed to at most one worker at a time. Adding a key that is
//! already queued is a no-op; adding one that a worker is processing marks it
//! dirty, and [`WorkQueue::done`] puts it back in the queue. Delayed adds
//! keep one timer per key, the earliest.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Queued,
    Processing,
    /// Added again while processing.
    Dirty,
}

pub struct WorkQueue<K> {
    tx: mpsc::UnboundedSender<K>,
    rx: Mutex<mpsc::UnboundedReceiver<K>>,
    state: DashMap<K, KeyState>,
    timers: DashMap<K, Instant>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            state: DashMap::new(),
            timers: DashMap::new(),
        }
    }

    pub fn add(&self, key: K) {
        match self.state.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == KeyState::Processing {
                    entry.insert(KeyState::Dirty);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(KeyState::Queued);
                // The receiver lives as long as the queue.
                let _ = self.tx.send(key);
            }
        }
    }

    /// Add `key` once `delay` has elapsed. A no-op when an earlier timer
    /// for `key` is already pending; a later one is superseded.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let at = Instant::now() + delay;
        match self.timers.entry(key.clone()) {
            Entry::Occupied(entry) if *entry.get() <= at => return,
            Entry::Occupied(mut entry) => {
                entry.insert(at);
            }
            Entry::Vacant(entry) => {
                entry.insert(at);
            }
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            if queue.timers.remove_if(&key, |_, pending| *pending == at).is_some() {
                queue.add(key);
            }
        });
    }

    /// Wait for the next key and mark it as processing.
    pub async fn next(&self) -> Option<K> {
        let key = self.rx.lock().await.recv().await?;
        self.state.insert(key.clone(), KeyState::Processing);
        Some(key)
    }

    /// Finish processing `key`, re-queueing it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let dirty = matches!(self.state.remove(key), Some((_, KeyState::Dirty)));
        if dirty {
            self.add(key.clone());
        }
    }

    /// Keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.state
            .iter()
            .filter(|entry| *entry.value() == KeyState::Queued)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
