//! # Database Shard
//!
//! Purpose: One independent keyspace — a concurrent map from key to value
//! object with read-through expiration and synchronous keyspace events.
//!
//! ## Design Principles
//! 1. **Per-Shard Lock**: A single `parking_lot::RwLock` guards the map; no
//!    lock ever spans shards, so per-key operations are linearizable and
//!    cross-shard deadlock is impossible by construction.
//! 2. **Publish Outside The Lock**: Mutations queue their events and publish
//!    after the guard drops, so a subscriber can never deadlock a shard.
//! 3. **Isolated Subscribers**: A panicking subscriber is caught and logged;
//!    the remaining subscribers still observe the event.
//! 4. **Expired Means Absent**: Every read path checks the expiration
//!    instant and eagerly removes dead entries, so no caller ever observes a
//!    logically-expired value.

use std::panic::{catch_unwind, AssertUnwindSafe};

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::event::{EventKind, KeyspaceEvent, Subscriber};
use crate::value::{now_ms, Entry, Value, ValueKind};

type EntryMap = HashMap<Bytes, Entry, RandomState>;

/// One of the N independent keyspaces addressable by `SELECT`.
pub struct Shard {
    index: usize,
    entries: RwLock<EntryMap>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl Shard {
    pub fn new(index: usize) -> Self {
        Shard {
            index,
            entries: RwLock::new(EntryMap::default()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Registers a keyspace event subscriber.
    pub fn subscribe(&self, subscriber: Subscriber) {
        self.subscribers.write().push(subscriber);
    }

    /// Inserts or replaces a value, resetting any expiration.
    pub fn set(&self, key: Bytes, value: Value) {
        let mut pending = Vec::new();
        {
            let mut entries = self.entries.write();
            let kind = if entries.contains_key(&key) {
                EventKind::Updated
            } else {
                EventKind::Added
            };
            entries.insert(key.clone(), Entry::new(value));
            pending.push((kind, key));
        }
        self.publish_all(pending);
    }

    /// Returns a clone of the live value under `key`.
    pub fn get(&self, key: &[u8]) -> Option<Value> {
        self.read(key, |value| value.clone())
    }

    /// Runs `f` against the live value under `key`, bumping last-access.
    ///
    /// Expired entries are removed, announced, and reported as absent.
    pub fn read<R>(&self, key: &[u8], f: impl FnOnce(&Value) -> R) -> Option<R> {
        let now = now_ms();
        let mut pending = Vec::new();
        let result = {
            let mut entries = self.entries.write();
            if Self::drop_if_expired(&mut entries, key, now, &mut pending) {
                None
            } else {
                entries.get_mut(key).map(|entry| {
                    entry.touch(now);
                    f(&entry.value)
                })
            }
        };
        self.publish_all(pending);
        result
    }

    /// Runs `f` against a mutable view of the live value under `key`.
    pub fn write<R>(&self, key: &[u8], f: impl FnOnce(&mut Value) -> R) -> Option<R> {
        let now = now_ms();
        let mut pending = Vec::new();
        let result = {
            let mut entries = self.entries.write();
            if Self::drop_if_expired(&mut entries, key, now, &mut pending) {
                None
            } else {
                match entries.get_mut(key) {
                    Some(entry) => {
                        let result = f(&mut entry.value);
                        pending.push((EventKind::Updated, Bytes::copy_from_slice(key)));
                        Some(result)
                    }
                    None => None,
                }
            }
        };
        self.publish_all(pending);
        result
    }

    /// Runs `f` against the live value under `key`, inserting `init()` first
    /// when the key is absent.
    pub fn write_or_insert<R>(
        &self,
        key: Bytes,
        init: impl FnOnce() -> Value,
        f: impl FnOnce(&mut Value) -> R,
    ) -> R {
        let now = now_ms();
        let mut pending = Vec::new();
        let result = {
            let mut entries = self.entries.write();
            Self::drop_if_expired(&mut entries, &key, now, &mut pending);
            let kind = if entries.contains_key(&key) {
                EventKind::Updated
            } else {
                entries.insert(key.clone(), Entry::new(init()));
                EventKind::Added
            };
            let entry = entries
                .get_mut(&key)
                .expect("entry inserted above cannot be absent");
            let result = f(&mut entry.value);
            pending.push((kind, key));
            result
        };
        self.publish_all(pending);
        result
    }

    /// Removes `key`. Returns true when a live entry was removed.
    pub fn delete(&self, key: &[u8]) -> bool {
        let now = now_ms();
        let mut pending = Vec::new();
        let removed = {
            let mut entries = self.entries.write();
            if Self::drop_if_expired(&mut entries, key, now, &mut pending) {
                false
            } else if entries.remove(key).is_some() {
                pending.push((EventKind::Deleted, Bytes::copy_from_slice(key)));
                true
            } else {
                false
            }
        };
        self.publish_all(pending);
        removed
    }

    /// Removes `key` when its container payload has drained to empty.
    pub fn delete_if_empty(&self, key: &[u8]) -> bool {
        let mut pending = Vec::new();
        let removed = {
            let mut entries = self.entries.write();
            let empty = entries
                .get(key)
                .map(|entry| entry.value.is_empty_container())
                .unwrap_or(false);
            if empty {
                entries.remove(key);
                pending.push((EventKind::Deleted, Bytes::copy_from_slice(key)));
            }
            empty
        };
        self.publish_all(pending);
        removed
    }

    /// True when a live entry exists under `key`.
    pub fn exists(&self, key: &[u8]) -> bool {
        self.read(key, |_| ()).is_some()
    }

    /// Variant of the live value under `key`, if any.
    pub fn value_kind(&self, key: &[u8]) -> Option<ValueKind> {
        self.read(key, |value| value.kind())
    }

    /// Snapshot of all live key names.
    pub fn keys(&self) -> Vec<Bytes> {
        let now = now_ms();
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = now_ms();
        let entries = self.entries.read();
        entries
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry, announcing each removal.
    pub fn clear(&self) {
        let mut pending = Vec::new();
        {
            let mut entries = self.entries.write();
            for (key, _) in entries.drain() {
                pending.push((EventKind::Deleted, key));
            }
        }
        self.publish_all(pending);
    }

    /// Attaches an expiration `ttl_ms` from now. Returns true when the key
    /// exists and the expiration was set.
    pub fn expire(&self, key: &[u8], ttl_ms: u64) -> bool {
        let now = now_ms();
        let mut pending = Vec::new();
        let set = {
            let mut entries = self.entries.write();
            if Self::drop_if_expired(&mut entries, key, now, &mut pending) {
                false
            } else {
                match entries.get_mut(key) {
                    Some(entry) => {
                        entry.expires_at = Some(now.saturating_add(ttl_ms));
                        pending.push((EventKind::ExpireSet, Bytes::copy_from_slice(key)));
                        true
                    }
                    None => false,
                }
            }
        };
        self.publish_all(pending);
        set
    }

    /// Remaining time-to-live in milliseconds: `-1` when the key never
    /// expires, `-2` when it is absent.
    pub fn ttl_ms(&self, key: &[u8]) -> i64 {
        let now = now_ms();
        let mut pending = Vec::new();
        let ttl = {
            let mut entries = self.entries.write();
            if Self::drop_if_expired(&mut entries, key, now, &mut pending) {
                -2
            } else {
                match entries.get(key) {
                    Some(entry) => match entry.expires_at {
                        Some(deadline) => deadline.saturating_sub(now) as i64,
                        None => -1,
                    },
                    None => -2,
                }
            }
        };
        self.publish_all(pending);
        ttl
    }

    /// Clears any expiration. Returns true when one was present.
    pub fn persist(&self, key: &[u8]) -> bool {
        let now = now_ms();
        let mut pending = Vec::new();
        let cleared = {
            let mut entries = self.entries.write();
            if Self::drop_if_expired(&mut entries, key, now, &mut pending) {
                false
            } else {
                match entries.get_mut(key) {
                    Some(entry) => entry.expires_at.take().is_some(),
                    None => false,
                }
            }
        };
        self.publish_all(pending);
        cleared
    }

    /// True when an entry is present but past its expiration instant.
    ///
    /// Unlike the read paths this does not remove the entry; it exists for
    /// observation in tests and diagnostics.
    pub fn is_expired(&self, key: &[u8]) -> bool {
        let now = now_ms();
        let entries = self.entries.read();
        entries
            .get(key)
            .map(|entry| entry.is_expired(now))
            .unwrap_or(false)
    }

    /// Reaper sweep: removes every entry whose expiration instant passed.
    pub fn purge_expired(&self, now: u64) -> usize {
        let mut pending = Vec::new();
        {
            let mut entries = self.entries.write();
            let dead: Vec<Bytes> = entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in dead {
                entries.remove(&key);
                pending.push((EventKind::Expired, key));
            }
        }
        let removed = pending.len();
        self.publish_all(pending);
        removed
    }

    /// Clones the current contents for serialization under a read guard.
    ///
    /// Lifecycle state (subscribers) is intentionally not part of the
    /// snapshot; only keys, payloads, and expirations travel.
    pub fn snapshot_entries(&self) -> Vec<(Bytes, Entry)> {
        let entries = self.entries.read();
        entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Replaces the shard contents in place, keeping subscribers bound.
    pub fn replace_contents(&self, contents: Vec<(Bytes, Entry)>) {
        let mut entries = self.entries.write();
        entries.clear();
        for (key, entry) in contents {
            entries.insert(key, entry);
        }
    }

    fn drop_if_expired(
        entries: &mut EntryMap,
        key: &[u8],
        now: u64,
        pending: &mut Vec<(EventKind, Bytes)>,
    ) -> bool {
        let expired = entries
            .get(key)
            .map(|entry| entry.is_expired(now))
            .unwrap_or(false);
        if expired {
            entries.remove(key);
            pending.push((EventKind::Expired, Bytes::copy_from_slice(key)));
        }
        expired
    }

    fn publish_all(&self, pending: Vec<(EventKind, Bytes)>) {
        if pending.is_empty() {
            return;
        }
        let subscribers = self.subscribers.read().clone();
        if subscribers.is_empty() {
            return;
        }
        for (kind, key) in pending {
            let event = KeyspaceEvent {
                shard: self.index,
                kind,
                key,
            };
            for subscriber in &subscribers {
                let callback = subscriber.as_ref();
                if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                    tracing::warn!(shard = self.index, "keyspace subscriber panicked");
                }
            }
        }
    }
}
