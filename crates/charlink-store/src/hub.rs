//! Fan-out of whole snapshots to live subscribers.
//!
//! One `watch` channel per key.  Each published value supersedes the
//! previous one, so a slow subscriber only ever sees the newest snapshot.
//! Channels whose last receiver has gone are dropped on the next publish.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::watch;

pub struct SnapshotHub<K, V> {
    channels: Mutex<HashMap<K, watch::Sender<V>>>,
}

impl<K, V> SnapshotHub<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to `key`, seeding the channel with `current` when nobody
    /// else is watching it yet.
    ///
    /// Callers must hold whatever lock guards the backing data so that
    /// `current` cannot be overtaken by a concurrent [`publish`].
    ///
    /// [`publish`]: SnapshotHub::publish
    pub fn subscribe(&self, key: &K, current: V) -> watch::Receiver<V> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        match channels.get(key) {
            Some(tx) if !tx.is_closed() => {
                tx.send_replace(current);
                tx.subscribe()
            }
            _ => {
                let (tx, rx) = watch::channel(current);
                channels.insert(key.clone(), tx);
                rx
            }
        }
    }

    /// Push a new snapshot to every subscriber of `key`.  A no-op when
    /// nobody is subscribed.
    pub fn publish(&self, key: &K, snapshot: V) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let closed = match channels.get(key) {
            Some(tx) => tx.send(snapshot).is_err(),
            None => return,
        };
        if closed {
            channels.remove(key);
        }
    }

    /// Number of keys with at least one live subscriber.
    pub fn active(&self) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.values().filter(|tx| !tx.is_closed()).count()
    }
}

impl<K, V> Default for SnapshotHub<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
