//! # Binary Value Codec
//!
//! Purpose: The explicit framed encoding shared by the snapshot file and the
//! replication payload. Every field is length-prefixed or fixed-width, so
//! the format is portable across builds and never depends on type names.
//!
//! Layout per entry:
//! - `u8` variant tag
//! - variant payload (string: `u32` len + bytes; list/set: `u32` count then
//!   length-prefixed items; hash: `u32` count then field/value pairs; zset:
//!   `u32` count then member + `f64` score, big-endian)
//! - `u8` expiration flag, then `i64` absolute expiration ms when set
//!
//! Lifecycle state (subscribers, timers, access stamps) never travels; the
//! decoder re-stamps entries at load time.

use bytes::{Buf, BufMut, Bytes};
use rudis_common::{RudisError, RudisResult};

use crate::value::{Entry, SortedSet, Value};

const TAG_STR: u8 = 0;
const TAG_LIST: u8 = 1;
const TAG_SET: u8 = 2;
const TAG_HASH: u8 = 3;
const TAG_ZSET: u8 = 4;

/// Appends a length-prefixed byte string.
pub fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Reads a length-prefixed byte string.
pub fn take_bytes(buf: &mut &[u8]) -> RudisResult<Bytes> {
    let len = take_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(RudisError::Corrupt(format!(
            "byte string of {len} bytes exceeds remaining {}",
            buf.remaining()
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn take_u8(buf: &mut &[u8]) -> RudisResult<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn take_u32(buf: &mut &[u8]) -> RudisResult<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn take_i32(buf: &mut &[u8]) -> RudisResult<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn take_i64(buf: &mut &[u8]) -> RudisResult<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

pub fn take_f64(buf: &mut &[u8]) -> RudisResult<f64> {
    ensure(buf, 8)?;
    Ok(buf.get_f64())
}

fn ensure(buf: &&[u8], needed: usize) -> RudisResult<()> {
    if buf.remaining() < needed {
        return Err(RudisError::Corrupt(format!(
            "need {needed} bytes, {} remaining",
            buf.remaining()
        )));
    }
    Ok(())
}

/// Encodes one entry (payload + expiration).
pub fn encode_entry(buf: &mut Vec<u8>, entry: &Entry) {
    match &entry.value {
        Value::Str(data) => {
            buf.put_u8(TAG_STR);
            put_bytes(buf, data);
        }
        Value::List(items) => {
            buf.put_u8(TAG_LIST);
            buf.put_u32(items.len() as u32);
            for item in items {
                put_bytes(buf, item);
            }
        }
        Value::Set(members) => {
            buf.put_u8(TAG_SET);
            buf.put_u32(members.len() as u32);
            for member in members {
                put_bytes(buf, member);
            }
        }
        Value::Hash(fields) => {
            buf.put_u8(TAG_HASH);
            buf.put_u32(fields.len() as u32);
            for (field, value) in fields {
                put_bytes(buf, field);
                put_bytes(buf, value);
            }
        }
        Value::ZSet(zset) => {
            buf.put_u8(TAG_ZSET);
            buf.put_u32(zset.len() as u32);
            for (member, score) in zset.iter_asc() {
                put_bytes(buf, member);
                buf.put_f64(score);
            }
        }
    }
    match entry.expires_at {
        Some(deadline) => {
            buf.put_u8(1);
            buf.put_i64(deadline as i64);
        }
        None => buf.put_u8(0),
    }
}

/// Decodes one entry, re-stamping creation and access instants.
pub fn decode_entry(buf: &mut &[u8]) -> RudisResult<Entry> {
    let tag = take_u8(buf)?;
    let value = match tag {
        TAG_STR => Value::Str(take_bytes(buf)?),
        TAG_LIST => {
            let count = take_u32(buf)?;
            let mut items = std::collections::VecDeque::with_capacity(count as usize);
            for _ in 0..count {
                items.push_back(take_bytes(buf)?);
            }
            Value::List(items)
        }
        TAG_SET => {
            let count = take_u32(buf)?;
            let mut members = std::collections::BTreeSet::new();
            for _ in 0..count {
                members.insert(take_bytes(buf)?);
            }
            Value::Set(members)
        }
        TAG_HASH => {
            let count = take_u32(buf)?;
            let mut fields = hashbrown::HashMap::with_capacity(count as usize);
            for _ in 0..count {
                let field = take_bytes(buf)?;
                let value = take_bytes(buf)?;
                fields.insert(field, value);
            }
            Value::Hash(fields)
        }
        TAG_ZSET => {
            let count = take_u32(buf)?;
            let mut zset = SortedSet::new();
            for _ in 0..count {
                let member = take_bytes(buf)?;
                let score = take_f64(buf)?;
                zset.insert(member, score);
            }
            Value::ZSet(zset)
        }
        other => {
            return Err(RudisError::Corrupt(format!("unknown value tag {other}")));
        }
    };

    let mut entry = Entry::new(value);
    if take_u8(buf)? == 1 {
        entry.expires_at = Some(take_i64(buf)?.max(0) as u64);
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, VecDeque};

    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn roundtrip(entry: &Entry) -> Entry {
        let mut buf = Vec::new();
        encode_entry(&mut buf, entry);
        let mut slice = buf.as_slice();
        let decoded = decode_entry(&mut slice).expect("decode");
        assert!(slice.is_empty(), "decoder must consume the whole entry");
        decoded
    }

    #[test]
    fn string_entry_roundtrips() {
        let entry = Entry::new(Value::Str(b("hello world")));
        let decoded = roundtrip(&entry);
        match decoded.value {
            Value::Str(data) => assert_eq!(data, b("hello world")),
            other => panic!("wrong variant: {other:?}"),
        }
        assert_eq!(decoded.expires_at, None);
    }

    #[test]
    fn list_preserves_order() {
        let mut items = VecDeque::new();
        items.push_back(b("c"));
        items.push_back(b("b"));
        items.push_back(b("a"));
        let decoded = roundtrip(&Entry::new(Value::List(items.clone())));
        match decoded.value {
            Value::List(out) => assert_eq!(out, items),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn zset_preserves_scores_and_ties() {
        let mut zset = SortedSet::new();
        zset.insert(b("a"), 1.0);
        zset.insert(b("b"), 2.0);
        zset.insert(b("c"), 2.0);
        let decoded = roundtrip(&Entry::new(Value::ZSet(zset)));
        match decoded.value {
            Value::ZSet(out) => {
                assert!(out.indices_consistent());
                let order: Vec<_> = out.iter_asc().map(|(m, s)| (m.clone(), s)).collect();
                assert_eq!(order, vec![(b("a"), 1.0), (b("b"), 2.0), (b("c"), 2.0)]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn expiration_travels_with_the_entry() {
        let mut entry = Entry::new(Value::Str(b("v")));
        entry.expires_at = Some(1_900_000_000_000);
        let decoded = roundtrip(&entry);
        assert_eq!(decoded.expires_at, Some(1_900_000_000_000));
    }

    #[test]
    fn hash_and_set_roundtrip() {
        let mut fields = hashbrown::HashMap::new();
        fields.insert(b("f1"), b("v1"));
        fields.insert(b("f2"), b("v2"));
        let decoded = roundtrip(&Entry::new(Value::Hash(fields.clone())));
        match decoded.value {
            Value::Hash(out) => assert_eq!(out, fields),
            other => panic!("wrong variant: {other:?}"),
        }

        let mut members = BTreeSet::new();
        members.insert(b("x"));
        members.insert(b("y"));
        let decoded = roundtrip(&Entry::new(Value::Set(members.clone())));
        match decoded.value {
            Value::Set(out) => assert_eq!(out, members),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn truncated_input_is_rejected_not_panicked() {
        let entry = Entry::new(Value::Str(b("payload")));
        let mut buf = Vec::new();
        encode_entry(&mut buf, &entry);

        for cut in 0..buf.len() {
            let mut slice = &buf[..cut];
            assert!(decode_entry(&mut slice).is_err(), "cut at {cut} must fail");
        }
    }

    #[test]
    fn unknown_tag_is_corrupt() {
        let mut slice: &[u8] = &[9, 0, 0, 0, 0];
        assert!(matches!(
            decode_entry(&mut slice),
            Err(RudisError::Corrupt(_))
        ));
    }
}
