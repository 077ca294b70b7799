//! # Keyspace Events
//!
//! Purpose: Describe the mutations a shard announces to its subscribers.
//! Subscribers are plain callback values owned by the shard; nothing holds a
//! reference back to the shard, so the arrow points one way and serialized
//! state never carries a subscriber.

use std::sync::Arc;

use bytes::Bytes;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A key was created.
    Added,
    /// An existing key's value changed.
    Updated,
    /// A key was removed by an explicit delete.
    Deleted,
    /// A key was removed because its expiration instant passed.
    Expired,
    /// An expiration instant was attached to a key.
    ExpireSet,
}

/// One keyspace mutation, published synchronously after the shard lock is
/// released.
#[derive(Debug, Clone)]
pub struct KeyspaceEvent {
    /// Index of the shard the key lives in.
    pub shard: usize,
    pub kind: EventKind,
    pub key: Bytes,
}

/// Subscriber callback. Shards clone the `Arc` per publication, so callbacks
/// must be cheap and must not call back into the publishing shard.
pub type Subscriber = Arc<dyn Fn(&KeyspaceEvent) + Send + Sync>;
