//! # Append-Log Persistence
//!
//! Purpose: Journal every write command as one line and rebuild the keyspace
//! by replaying the journal. The format is `COMMAND arg1 arg2 ...` with
//! single-space separation; a leading `SELECT i` line switches the shard
//! replayed into. Arguments are unquoted, so values containing whitespace do
//! not round-trip (a known limitation of the line format).
//!
//! ## Design Principles
//! 1. **One Guarded Handle**: Appends from any number of connections funnel
//!    through a single mutex-held writer, so lines never interleave.
//! 2. **Appends Never Abort Commands**: A failed append is logged and the
//!    originating command still succeeds against the in-memory state.
//! 3. **Permissive Replay**: The loader skips blanks, logs and skips
//!    malformed lines, and ignores commands it does not know — replay is
//!    strictly more permissive than command dispatch.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rudis_common::{AofFsync, RudisError, RudisResult};

use crate::shard::Shard;
use crate::value::{now_ms, SortedSet, Value};

struct LogWriter {
    out: Option<BufWriter<File>>,
    /// Shard index of the last emitted `SELECT`, to avoid repeating it.
    selected: Option<usize>,
}

/// The append-only command log.
pub struct AppendLog {
    path: PathBuf,
    fsync: AofFsync,
    inner: Mutex<LogWriter>,
}

impl AppendLog {
    pub fn new(path: PathBuf, fsync: AofFsync) -> RudisResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let out = open_append(&path)?;
        Ok(AppendLog {
            path,
            fsync,
            inner: Mutex::new(LogWriter {
                out: Some(out),
                selected: None,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current on-disk size of the log.
    pub fn size(&self) -> u64 {
        fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0)
    }

    /// Appends one command line for `shard`, prefixed by a `SELECT` line
    /// when the active shard changed. Failures are logged, never surfaced.
    pub fn append(&self, shard: usize, parts: &[&[u8]]) {
        if parts.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        if let Err(err) = Self::append_locked(&mut inner, self.fsync, shard, parts) {
            tracing::warn!(error = %err, "append-log write failed");
        }
    }

    fn append_locked(
        inner: &mut LogWriter,
        fsync: AofFsync,
        shard: usize,
        parts: &[&[u8]],
    ) -> RudisResult<()> {
        let out = inner
            .out
            .as_mut()
            .ok_or_else(|| RudisError::Persistence("append-log writer closed".to_string()))?;

        if inner.selected != Some(shard) {
            writeln!(out, "SELECT {shard}")?;
            inner.selected = Some(shard);
        }
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                out.write_all(b" ")?;
            }
            out.write_all(part)?;
        }
        out.write_all(b"\n")?;

        if fsync == AofFsync::Always {
            out.flush()?;
            out.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Flushes buffered lines and syncs file data to disk.
    pub fn flush(&self) -> RudisResult<()> {
        let mut inner = self.inner.lock();
        if let Some(out) = inner.out.as_mut() {
            out.flush()?;
            out.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Closes the writer after a final flush. Further appends are dropped.
    pub fn close(&self) -> RudisResult<()> {
        let mut inner = self.inner.lock();
        if let Some(mut out) = inner.out.take() {
            out.flush()?;
            out.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Replaces the log with a minimal transcript reconstructing the current
    /// keyspace, then reopens the writer over the new file.
    pub fn rewrite(&self, shards: &[Arc<Shard>]) -> RudisResult<()> {
        let mut inner = self.inner.lock();

        let tmp = tmp_path(&self.path);
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            write_transcript(&mut out, shards)?;
            out.flush()?;
            out.get_ref().sync_data()?;
        }

        // Swap under the writer lock so no append lands in the old file.
        inner.out = None;
        atomic_replace(&tmp, &self.path)?;
        inner.out = Some(open_append(&self.path)?);
        inner.selected = None;
        tracing::debug!(path = %self.path.display(), "append-log rewritten");
        Ok(())
    }

    /// Replays the log into `shards`.
    pub fn load(&self, shards: &[Arc<Shard>]) -> RudisResult<()> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(_) => return Ok(()),
        };

        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut selected = 0usize;
        let mut line_no = 0u64;
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            line_no += 1;
            while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            if let Err(err) = replay_line(&line, shards, &mut selected) {
                tracing::warn!(line = line_no, error = %err, "skipping malformed append-log line");
            }
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> RudisResult<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

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

fn write_transcript(out: &mut BufWriter<File>, shards: &[Arc<Shard>]) -> RudisResult<()> {
    let now = now_ms();
    for shard in shards {
        let entries = shard.snapshot_entries();
        if entries.is_empty() {
            continue;
        }
        writeln!(out, "SELECT {}", shard.index())?;
        for (key, entry) in entries {
            if entry.is_expired(now) {
                continue;
            }
            match &entry.value {
                Value::Str(data) => {
                    write_line(out, &[b"SET", &key, data])?;
                }
                Value::List(items) => {
                    for item in items {
                        write_line(out, &[b"RPUSH", &key, item])?;
                    }
                }
                Value::Set(members) => {
                    for member in members {
                        write_line(out, &[b"SADD", &key, member])?;
                    }
                }
                Value::Hash(fields) => {
                    for (field, value) in fields {
                        write_line(out, &[b"HSET", &key, field, value])?;
                    }
                }
                Value::ZSet(zset) => {
                    for (member, score) in zset.iter_asc() {
                        let score = format!("{score:?}");
                        write_line(out, &[b"ZADD", &key, score.as_bytes(), member])?;
                    }
                }
            }
            if let Some(deadline) = entry.expires_at {
                let remaining = deadline.saturating_sub(now);
                if remaining > 0 {
                    let remaining = remaining.to_string();
                    write_line(out, &[b"PEXPIRE", &key, remaining.as_bytes()])?;
                }
            }
        }
    }
    Ok(())
}

fn write_line(out: &mut BufWriter<File>, parts: &[&[u8]]) -> RudisResult<()> {
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.write_all(b" ")?;
        }
        out.write_all(part)?;
    }
    out.write_all(b"\n")?;
    Ok(())
}

/// Minimal replay interpreter over the rewrite vocabulary plus `PEXPIRE`.
fn replay_line(line: &[u8], shards: &[Arc<Shard>], selected: &mut usize) -> RudisResult<()> {
    let tokens: Vec<&[u8]> = line.split(|b| *b == b' ').filter(|t| !t.is_empty()).collect();
    let Some(&command) = tokens.first() else {
        return Ok(());
    };
    let command = command.to_ascii_uppercase();

    if command == b"SELECT" {
        let index = parse_usize(tokens.get(1))?;
        if index >= shards.len() {
            return Err(RudisError::UnknownShard);
        }
        *selected = index;
        return Ok(());
    }

    let Some(shard) = shards.get(*selected) else {
        return Err(RudisError::UnknownShard);
    };

    match command.as_slice() {
        b"SET" => {
            if tokens.len() != 3 {
                return Err(RudisError::WrongArity("SET".to_string()));
            }
            shard.set(Bytes::copy_from_slice(tokens[1]), Value::Str(Bytes::copy_from_slice(tokens[2])));
        }
        b"RPUSH" | b"LPUSH" => {
            if tokens.len() < 3 {
                return Err(RudisError::WrongArity("RPUSH".to_string()));
            }
            let front = command == b"LPUSH";
            let key = Bytes::copy_from_slice(tokens[1]);
            shard.write_or_insert(
                key,
                || Value::List(Default::default()),
                |value| {
                    if let Value::List(items) = value {
                        for token in &tokens[2..] {
                            let item = Bytes::copy_from_slice(token);
                            if front {
                                items.push_front(item);
                            } else {
                                items.push_back(item);
                            }
                        }
                    }
                },
            );
        }
        b"SADD" => {
            if tokens.len() < 3 {
                return Err(RudisError::WrongArity("SADD".to_string()));
            }
            let key = Bytes::copy_from_slice(tokens[1]);
            shard.write_or_insert(
                key,
                || Value::Set(Default::default()),
                |value| {
                    if let Value::Set(members) = value {
                        for token in &tokens[2..] {
                            members.insert(Bytes::copy_from_slice(token));
                        }
                    }
                },
            );
        }
        b"HSET" => {
            if tokens.len() < 4 || tokens.len() % 2 != 0 {
                return Err(RudisError::WrongArity("HSET".to_string()));
            }
            let key = Bytes::copy_from_slice(tokens[1]);
            shard.write_or_insert(
                key,
                || Value::Hash(Default::default()),
                |value| {
                    if let Value::Hash(fields) = value {
                        for pair in tokens[2..].chunks(2) {
                            fields.insert(
                                Bytes::copy_from_slice(pair[0]),
                                Bytes::copy_from_slice(pair[1]),
                            );
                        }
                    }
                },
            );
        }
        b"ZADD" => {
            if tokens.len() != 4 {
                return Err(RudisError::WrongArity("ZADD".to_string()));
            }
            let score = parse_f64(tokens[2])?;
            let key = Bytes::copy_from_slice(tokens[1]);
            let member = Bytes::copy_from_slice(tokens[3]);
            shard.write_or_insert(
                key,
                || Value::ZSet(SortedSet::new()),
                |value| {
                    if let Value::ZSet(zset) = value {
                        zset.insert(member.clone(), score);
                    }
                },
            );
        }
        b"PEXPIRE" | b"EXPIRE" => {
            if tokens.len() != 3 {
                return Err(RudisError::WrongArity("PEXPIRE".to_string()));
            }
            let mut ttl = parse_u64(tokens[2])?;
            if command == b"EXPIRE" {
                ttl = ttl.saturating_mul(1000);
            }
            shard.expire(tokens[1], ttl);
        }
        b"PERSIST" => {
            if tokens.len() == 2 {
                shard.persist(tokens[1]);
            }
        }
        b"DEL" => {
            for token in &tokens[1..] {
                shard.delete(token);
            }
        }
        b"FLUSHDB" => {
            shard.replace_contents(Vec::new());
        }
        // Replay is strictly more permissive than dispatch.
        _ => {}
    }
    Ok(())
}

fn parse_usize(token: Option<&&[u8]>) -> RudisResult<usize> {
    let token = token.ok_or(RudisError::UnknownShard)?;
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RudisError::UnknownShard)
}

fn parse_u64(token: &[u8]) -> RudisResult<u64> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RudisError::NotAnInteger)
}

fn parse_f64(token: &[u8]) -> RudisResult<f64> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RudisError::NotAFloat)
}
