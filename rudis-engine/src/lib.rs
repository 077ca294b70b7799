//! # rudis-engine
//!
//! The keyspace core: typed value objects, concurrent shards with keyspace
//! events and lazy expiration, the background reaper, and the two
//! persistence strategies (snapshot and append-log) coordinated by the
//! database manager.

pub mod aof;
pub mod codec;
pub mod event;
pub mod manager;
pub mod shard;
pub mod snapshot;
pub mod value;

pub use aof::AppendLog;
pub use event::{EventKind, KeyspaceEvent, Subscriber};
pub use manager::DbManager;
pub use shard::Shard;
pub use snapshot::SnapshotStore;
pub use value::{now_ms, Entry, SortedSet, Value, ValueKind};
