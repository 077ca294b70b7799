//! Generic keyspace commands.

use rudis_common::{key_pattern_matches, RudisError, RudisResult};
use rudis_engine::Shard;

use super::{arity, min_arity, parse_int};
use crate::resp;

pub fn del(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    min_arity(args, 2, "DEL")?;
    let mut removed = 0i64;
    for key in &args[1..] {
        if shard.delete(key) {
            removed += 1;
        }
    }
    Ok(resp::integer(removed))
}

pub fn exists(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    min_arity(args, 2, "EXISTS")?;
    let mut present = 0i64;
    for key in &args[1..] {
        if shard.exists(key) {
            present += 1;
        }
    }
    Ok(resp::integer(present))
}

pub fn type_of(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "TYPE")?;
    Ok(match shard.value_kind(&args[1]) {
        Some(kind) => resp::simple(kind.as_str()),
        None => resp::simple("none"),
    })
}

pub fn expire(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 3, "EXPIRE")?;
    let seconds = parse_int(&args[2])?;
    set_expiry(shard, &args[1], seconds.saturating_mul(1000))
}

pub fn pexpire(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 3, "PEXPIRE")?;
    let millis = parse_int(&args[2])?;
    set_expiry(shard, &args[1], millis)
}

fn set_expiry(shard: &Shard, key: &[u8], ttl_ms: i64) -> RudisResult<Vec<u8>> {
    if ttl_ms <= 0 {
        // A non-positive ttl expires the key immediately.
        let existed = shard.delete(key);
        return Ok(if existed {
            resp::simple("OK")
        } else {
            resp::integer(0)
        });
    }
    Ok(if shard.expire(key, ttl_ms as u64) {
        resp::simple("OK")
    } else {
        resp::integer(0)
    })
}

pub fn ttl(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "TTL")?;
    let ms = shard.ttl_ms(&args[1]);
    Ok(resp::integer(match ms {
        -2 | -1 => ms,
        // Round up so a freshly-set EXPIRE k 10 reads back as 10.
        remaining => (remaining + 999) / 1000,
    }))
}

pub fn pttl(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "PTTL")?;
    Ok(resp::integer(shard.ttl_ms(&args[1])))
}

pub fn persist(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "PERSIST")?;
    Ok(resp::integer(i64::from(shard.persist(&args[1]))))
}

pub fn keys(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "KEYS")?;
    let pattern = &args[1];
    let mut matches: Vec<_> = shard
        .keys()
        .into_iter()
        .filter(|key| key_pattern_matches(pattern, key))
        .collect();
    matches.sort();
    Ok(resp::array(matches))
}

pub fn flushdb(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    if args.len() != 1 {
        return Err(RudisError::WrongArity("FLUSHDB".to_string()));
    }
    shard.clear();
    Ok(resp::simple("OK"))
}
