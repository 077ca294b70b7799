//! # Typed Value Objects
//!
//! Purpose: Define the tagged value stored under every key — one of five
//! payload shapes plus expiration metadata — and the two-index sorted set
//! whose score and member views must stay mutually consistent.
//!
//! ## Design Principles
//! 1. **Shape = Tag**: The enum variant is the single source of truth for a
//!    value's type; cross-variant operations fail before touching payloads.
//! 2. **Cheap Reads**: Payload bytes are `bytes::Bytes`, so reads hand out
//!    reference-counted clones instead of copying buffers.
//! 3. **Ordered Views For Free**: Sets are `BTreeSet` and sorted-set score
//!    buckets are `BTreeMap`, so lexicographic and score order fall out of
//!    the container choice rather than explicit sorting.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hashbrown::HashMap;

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// The five payload shapes a key can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    List,
    Set,
    Hash,
    ZSet,
}

impl ValueKind {
    /// Name reported by the `TYPE` command.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Str => "string",
            ValueKind::List => "list",
            ValueKind::Set => "set",
            ValueKind::Hash => "hash",
            ValueKind::ZSet => "zset",
        }
    }
}

/// Tagged payload of a value object.
#[derive(Debug, Clone)]
pub enum Value {
    /// Opaque byte string.
    Str(Bytes),
    /// Ordered sequence with O(1) head/tail operations.
    List(VecDeque<Bytes>),
    /// Unordered membership set; iteration is lexicographic.
    Set(BTreeSet<Bytes>),
    /// Field to value mapping.
    Hash(HashMap<Bytes, Bytes>),
    /// Score-ordered multimap with a member-to-score inverse.
    ZSet(SortedSet),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Str(_) => ValueKind::Str,
            Value::List(_) => ValueKind::List,
            Value::Set(_) => ValueKind::Set,
            Value::Hash(_) => ValueKind::Hash,
            Value::ZSet(_) => ValueKind::ZSet,
        }
    }

    /// True for container variants that have become empty.
    ///
    /// An empty container is removed from its shard rather than left behind,
    /// so `EXISTS`/`TYPE` never observe a hollow key.
    pub fn is_empty_container(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::List(items) => items.is_empty(),
            Value::Set(members) => members.is_empty(),
            Value::Hash(fields) => fields.is_empty(),
            Value::ZSet(zset) => zset.is_empty(),
        }
    }
}

/// Score key with a total order over f64.
///
/// `total_cmp` keeps NaN ordered instead of poisoning the tree; callers
/// reject NaN scores before they reach the container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score(pub f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Sorted set keeping two mutually consistent indices: score to the set of
/// members holding it, and member back to its score. Ties within one score
/// iterate in member lexicographic order via the bucket `BTreeSet`.
#[derive(Debug, Clone, Default)]
pub struct SortedSet {
    by_score: BTreeMap<Score, BTreeSet<Bytes>>,
    by_member: HashMap<Bytes, f64>,
}

impl SortedSet {
    pub fn new() -> Self {
        SortedSet::default()
    }

    pub fn len(&self) -> usize {
        self.by_member.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_member.is_empty()
    }

    /// Inserts or re-scores a member. Returns true when the member is new.
    pub fn insert(&mut self, member: Bytes, score: f64) -> bool {
        match self.by_member.get(&member).copied() {
            Some(old) if old == score => false,
            Some(old) => {
                self.unlink(&member, old);
                self.link(member, score);
                false
            }
            None => {
                self.link(member, score);
                true
            }
        }
    }

    /// Removes a member. Returns true when it was present.
    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.by_member.get(member).copied() {
            Some(score) => {
                let member = Bytes::copy_from_slice(member);
                self.unlink(&member, score);
                true
            }
            None => false,
        }
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.by_member.get(member).copied()
    }

    /// Adds `delta` to the member's score (0 if absent) and returns the new score.
    pub fn increment(&mut self, member: Bytes, delta: f64) -> f64 {
        let score = self.score(&member).unwrap_or(0.0) + delta;
        self.insert(member, score);
        score
    }

    /// Ascending iteration: score order, ties by member lexicographic order.
    pub fn iter_asc(&self) -> impl Iterator<Item = (&Bytes, f64)> {
        self.by_score
            .iter()
            .flat_map(|(score, members)| members.iter().map(move |m| (m, score.0)))
    }

    /// Descending iteration, the exact reverse of [`iter_asc`].
    pub fn iter_desc(&self) -> impl Iterator<Item = (&Bytes, f64)> {
        self.by_score
            .iter()
            .rev()
            .flat_map(|(score, members)| members.iter().rev().map(move |m| (m, score.0)))
    }

    /// Zero-based position of the member in ascending order.
    pub fn rank(&self, member: &[u8]) -> Option<usize> {
        self.score(member)?;
        self.iter_asc().position(|(m, _)| m.as_ref() == member)
    }

    /// Zero-based position of the member in descending order.
    pub fn rev_rank(&self, member: &[u8]) -> Option<usize> {
        self.score(member)?;
        self.iter_desc().position(|(m, _)| m.as_ref() == member)
    }

    /// Number of members with `min <= score <= max`.
    pub fn count_in_range(&self, min: f64, max: f64) -> usize {
        if min > max {
            return 0;
        }
        self.by_score
            .range(Score(min)..=Score(max))
            .map(|(_, members)| members.len())
            .sum()
    }

    fn link(&mut self, member: Bytes, score: f64) {
        self.by_score
            .entry(Score(score))
            .or_default()
            .insert(member.clone());
        self.by_member.insert(member, score);
    }

    fn unlink(&mut self, member: &Bytes, score: f64) {
        if let Some(bucket) = self.by_score.get_mut(&Score(score)) {
            bucket.remove(member);
            if bucket.is_empty() {
                self.by_score.remove(&Score(score));
            }
        }
        self.by_member.remove(member);
    }

    /// True when the two indices agree exactly: every member sits in the one
    /// bucket matching its recorded score, and no bucket holds strays.
    pub fn indices_consistent(&self) -> bool {
        let linked: usize = self.by_score.values().map(|b| b.len()).sum();
        if linked != self.by_member.len() {
            return false;
        }
        self.by_member.iter().all(|(member, &score)| {
            self.by_score
                .get(&Score(score))
                .map(|bucket| bucket.contains(member))
                .unwrap_or(false)
        })
    }
}

/// A stored value object: payload plus lifecycle instants.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Value,
    /// Creation instant, wall-clock ms.
    pub created_at: u64,
    /// Last read instant, bumped by shard reads.
    pub last_access: u64,
    /// Absolute expiration instant; `None` means the entry never expires.
    pub expires_at: Option<u64>,
}

impl Entry {
    pub fn new(value: Value) -> Self {
        let now = now_ms();
        Entry {
            value,
            created_at: now,
            last_access: now,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        match self.expires_at {
            Some(deadline) => now > deadline,
            None => false,
        }
    }

    pub fn touch(&mut self, now: u64) {
        self.last_access = now;
    }
}
