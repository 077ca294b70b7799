//! # Snapshot Persistence
//!
//! Purpose: Full-keyspace dump and recovery. The file is a raw 9-byte
//! `REDIS0001` header followed by a body stream — optionally gzip — holding
//! every shard's entries in the framed codec, closed by a `0xFF` trailer.
//!
//! ## Design Principles
//! 1. **Atomic Replace**: Saves land in `<path>.tmp` and rename over the
//!    live file, so a reader always sees either the old or the new complete
//!    snapshot, never a partial write.
//! 2. **Quarantine, Don't Die**: A corrupt file is renamed aside with a
//!    timestamp suffix and replaced by a fresh save; startup continues.
//! 3. **Dual-Read**: The loader tries the body as gzip first and falls back
//!    to plain, so a node recovers files written under either compression
//!    setting.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rudis_common::{RudisError, RudisResult};

use crate::codec::{self, put_bytes};
use crate::shard::Shard;
use crate::value::now_ms;

/// Magic prefix of every snapshot file.
pub const SNAPSHOT_HEADER: &[u8] = b"REDIS0001";
/// Byte closing the body stream.
pub const SNAPSHOT_TRAILER: u8 = 0xFF;
/// Upper bound accepted for the on-disk shard count.
const MAX_SHARD_COUNT: i32 = 100;

/// Writer/loader for the snapshot file.
pub struct SnapshotStore {
    path: PathBuf,
    compression: bool,
}

impl SnapshotStore {
    pub fn new(path: PathBuf, compression: bool) -> Self {
        SnapshotStore { path, compression }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serializes every shard and atomically replaces the snapshot file.
    pub fn save(&self, shards: &[Arc<Shard>]) -> RudisResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let body = encode_body(shards);
        let tmp = tmp_path(&self.path);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(SNAPSHOT_HEADER)?;
            if self.compression {
                let mut encoder = GzEncoder::new(&mut file, Compression::default());
                encoder.write_all(&body)?;
                encoder.finish()?;
            } else {
                file.write_all(&body)?;
            }
            file.flush()?;
        }

        atomic_replace(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), shards = shards.len(), "snapshot saved");
        Ok(())
    }

    /// Loads the snapshot into `shards`, establishing the invariant that a
    /// valid snapshot exists on disk once this returns.
    pub fn load(&self, shards: &[Arc<Shard>]) -> RudisResult<()> {
        let missing = match fs::metadata(&self.path) {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };
        if missing {
            // First start: materialize an empty snapshot and return.
            return self.save(shards);
        }

        let raw = fs::read(&self.path)?;
        if raw.len() < 5 || &raw[..5] != b"REDIS" {
            let quarantine = format!("{}.bak.{}", self.path.display(), now_ms());
            tracing::warn!(
                path = %self.path.display(),
                quarantine = %quarantine,
                "snapshot header mismatch, quarantining file"
            );
            fs::rename(&self.path, &quarantine)?;
            return self.save(shards);
        }

        let body = &raw[SNAPSHOT_HEADER.len()..];
        if let Ok(plain) = decompress(body) {
            if decode_body(&plain, shards).is_ok() {
                return Ok(());
            }
        }
        decode_body(body, shards)
    }
}

fn decompress(body: &[u8]) -> RudisResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(body);
    let mut plain = Vec::new();
    decoder
        .read_to_end(&mut plain)
        .map_err(|err| RudisError::Corrupt(format!("gzip body rejected: {err}")))?;
    Ok(plain)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Renames `tmp` over `target`; if the target blocks the rename it is
/// deleted and the rename retried once.
fn atomic_replace(tmp: &Path, target: &Path) -> RudisResult<()> {
    if fs::rename(tmp, target).is_ok() {
        return Ok(());
    }
    if target.exists() {
        fs::remove_file(target)?;
    }
    fs::rename(tmp, target).map_err(|err| {
        RudisError::Persistence(format!(
            "replacing {} failed after retry: {err}",
            target.display()
        ))
    })
}

fn encode_body(shards: &[Arc<Shard>]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(shards.len() as i32).to_be_bytes());
    for shard in shards {
        let entries = shard.snapshot_entries();
        body.extend_from_slice(&(shard.index() as i32).to_be_bytes());
        body.extend_from_slice(&(entries.len() as i32).to_be_bytes());
        for (key, entry) in entries {
            put_bytes(&mut body, &key);
            codec::encode_entry(&mut body, &entry);
        }
    }
    body.push(SNAPSHOT_TRAILER);
    body
}

fn decode_body(body: &[u8], shards: &[Arc<Shard>]) -> RudisResult<()> {
    let mut buf = body;
    let shard_count = codec::take_i32(&mut buf)?;
    if !(0..=MAX_SHARD_COUNT).contains(&shard_count) {
        return Err(RudisError::Corrupt(format!(
            "shard count {shard_count} outside [0, {MAX_SHARD_COUNT}]"
        )));
    }

    for _ in 0..shard_count {
        let index = codec::take_i32(&mut buf)?;
        let entry_count = codec::take_i32(&mut buf)?;
        if entry_count < 0 {
            return Err(RudisError::Corrupt(format!(
                "negative entry count for shard {index}"
            )));
        }

        let target = if index >= 0 {
            shards.get(index as usize)
        } else {
            None
        };
        let mut contents = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let key = codec::take_bytes(&mut buf)?;
            match codec::decode_entry(&mut buf) {
                Ok(entry) => contents.push((key, entry)),
                Err(err) => {
                    // One bad record must not take the whole load down, but
                    // the framing past it is unknowable; stop here with what
                    // decoded cleanly.
                    tracing::warn!(shard = index, error = %err, "skipping malformed snapshot entry");
                    if let Some(shard) = target {
                        shard.replace_contents(contents);
                    }
                    return Ok(());
                }
            }
        }

        match target {
            Some(shard) => shard.replace_contents(contents),
            None => {
                tracing::warn!(index, "snapshot references unknown shard, dropping its entries");
            }
        }
    }

    match codec::take_u8(&mut buf) {
        Ok(SNAPSHOT_TRAILER) => {}
        Ok(other) => tracing::warn!(byte = other, "unexpected snapshot trailer"),
        Err(_) => tracing::warn!("snapshot trailer missing"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::value::{SortedSet, Value};

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn shards(n: usize) -> Vec<Arc<Shard>> {
        (0..n).map(|i| Arc::new(Shard::new(i))).collect()
    }

    fn populate(shards: &[Arc<Shard>]) {
        shards[0].set(b("s"), Value::Str(b("value")));
        shards[0].write_or_insert(
            b("l"),
            || Value::List(Default::default()),
            |value| {
                if let Value::List(items) = value {
                    items.push_back(b("one"));
                    items.push_back(b("two"));
                }
            },
        );
        let mut zset = SortedSet::new();
        zset.insert(b("a"), 1.0);
        zset.insert(b("b"), 2.0);
        zset.insert(b("c"), 2.0);
        shards[1].set(b("z"), Value::ZSet(zset));
        shards[1].set(b("expiring"), Value::Str(b("v")));
        shards[1].expire(b"expiring", 120_000);
    }

    fn roundtrip(compression: bool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("dump.rdb"), compression);

        let source = shards(4);
        populate(&source);
        store.save(&source).expect("save");

        let restored = shards(4);
        store.load(&restored).expect("load");

        assert_eq!(restored[0].len(), 2);
        match restored[0].get(b"s") {
            Some(Value::Str(data)) => assert_eq!(data, b("value")),
            other => panic!("wrong value: {other:?}"),
        }
        match restored[1].get(b"z") {
            Some(Value::ZSet(zset)) => {
                assert!(zset.indices_consistent());
                assert_eq!(zset.score(b"c"), Some(2.0));
            }
            other => panic!("wrong value: {other:?}"),
        }
        let ttl = restored[1].ttl_ms(b"expiring");
        assert!(ttl > 0 && ttl <= 120_000, "ttl survived: {ttl}");
        assert!(restored[2].is_empty());
    }

    #[test]
    fn roundtrip_compressed() {
        roundtrip(true);
    }

    #[test]
    fn roundtrip_plain() {
        roundtrip(false);
    }

    #[test]
    fn loader_reads_either_compression_setting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dump.rdb");

        let source = shards(2);
        populate(&source);
        SnapshotStore::new(path.clone(), true)
            .save(&source)
            .expect("save compressed");

        // A node reconfigured to compression=false still loads the old file.
        let restored = shards(2);
        SnapshotStore::new(path, false)
            .load(&restored)
            .expect("load");
        assert!(restored[0].exists(b"s"));
    }

    #[test]
    fn missing_file_initializes_empty_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dump.rdb");
        let store = SnapshotStore::new(path.clone(), true);

        let empty = shards(2);
        store.load(&empty).expect("load");
        assert!(path.exists(), "load must leave a valid snapshot behind");

        // The materialized file is immediately loadable.
        store.load(&shards(2)).expect("reload");
    }

    #[test]
    fn corrupt_header_is_quarantined() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dump.rdb");
        fs::write(&path, b"not a snapshot at all").expect("write");

        let store = SnapshotStore::new(path.clone(), true);
        store.load(&shards(2)).expect("load survives corruption");

        let quarantined = fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".bak."));
        assert!(quarantined, "corrupt file must be renamed aside");
        assert!(path.exists(), "a fresh snapshot must replace it");
    }

    #[test]
    fn save_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dump.rdb");
        let store = SnapshotStore::new(path.clone(), true);
        store.save(&shards(2)).expect("save");

        assert!(path.exists());
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn load_clears_existing_shard_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("dump.rdb"), false);

        let source = shards(2);
        source[0].set(b("from-disk"), Value::Str(b("v")));
        store.save(&source).expect("save");

        let target = shards(2);
        target[0].set(b("stale"), Value::Str(b("v")));
        store.load(&target).expect("load");

        assert!(target[0].exists(b"from-disk"));
        assert!(!target[0].exists(b"stale"));
    }
}
