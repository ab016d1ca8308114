//! Map with per-entry expiry
//!
//! Entries expire lazily: an expired entry is treated as absent and removed
//! the next time it is read. Time is `tokio::time::Instant`, so paused-clock
//! tests can step through a TTL.

use std::hash::Hash;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

/// A concurrent map whose entries vanish after a fixed TTL
#[derive(Debug)]
pub struct ExpiringMap<K, V>
where
    K: Eq + Hash,
{
    ttl: Duration,
    entries: DashMap<K, (V, Instant)>,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or refresh an entry; the TTL starts now
    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(key, (value, Instant::now() + self.ttl));
    }

    /// Insert only if no fresh entry exists
    ///
    /// Returns whether the value was inserted.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let now = Instant::now();
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().1 > now {
                    return false;
                }
                occupied.insert((value, now + self.ttl));
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert((value, now + self.ttl));
                true
            }
        }
    }

    /// Whether a fresh entry exists
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        let fresh = match self.entries.get(key) {
            Some(entry) => entry.1 > now,
            None => return false,
        };
        if !fresh {
            self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        fresh
    }

    /// Remove and return a fresh entry
    pub fn take(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let (_, (value, expires)) = self.entries.remove(key)?;
        (expires > now).then_some(value)
    }

    /// Remove an entry regardless of age
    pub fn remove(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, (_, expires)| *expires > now);
    }

    /// Number of entries, fresh or not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
