//! Set commands.

use std::collections::BTreeSet;

use bytes::Bytes;
use rand::seq::IteratorRandom;
use rand::Rng;
use rudis_common::{RudisError, RudisResult};
use rudis_engine::{Shard, Value};

use super::{arity, min_arity, parse_int};
use crate::resp;

pub fn sadd(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    min_arity(args, 3, "SADD")?;
    let added = shard.write_or_insert(
        Bytes::copy_from_slice(&args[1]),
        || Value::Set(Default::default()),
        |value| match value {
            Value::Set(members) => {
                let mut added = 0i64;
                for arg in &args[2..] {
                    if members.insert(Bytes::copy_from_slice(arg)) {
                        added += 1;
                    }
                }
                Ok(added)
            }
            _ => Err(RudisError::WrongType),
        },
    )?;
    Ok(resp::integer(added))
}

pub fn srem(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    min_arity(args, 3, "SREM")?;
    let removed = shard
        .write(&args[1], |value| match value {
            Value::Set(members) => {
                let mut removed = 0i64;
                for arg in &args[2..] {
                    if members.remove(arg.as_slice()) {
                        removed += 1;
                    }
                }
                Ok(removed)
            }
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .unwrap_or(0);
    shard.delete_if_empty(&args[1]);
    Ok(resp::integer(removed))
}

pub fn smembers(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "SMEMBERS")?;
    let members = read_set(shard, &args[1])?;
    Ok(resp::array(members))
}

pub fn sismember(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 3, "SISMEMBER")?;
    let present = shard
        .read(&args[1], |value| match value {
            Value::Set(members) => Ok(members.contains(args[2].as_slice())),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .unwrap_or(false);
    Ok(resp::integer(i64::from(present)))
}

pub fn scard(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "SCARD")?;
    let len = shard
        .read(&args[1], |value| match value {
            Value::Set(members) => Ok(members.len() as i64),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .unwrap_or(0);
    Ok(resp::integer(len))
}

pub fn spop(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    if args.len() != 2 && args.len() != 3 {
        return Err(RudisError::WrongArity("SPOP".to_string()));
    }
    let count = match args.get(2) {
        Some(token) => {
            let count = parse_int(token)?;
            if count < 0 {
                return Err(RudisError::NotAnInteger);
            }
            Some(count as usize)
        }
        None => None,
    };

    let want = count.unwrap_or(1);
    let popped = shard
        .write(&args[1], |value| match value {
            Value::Set(members) => {
                let mut rng = rand::thread_rng();
                let chosen: Vec<Bytes> = members.iter().cloned().choose_multiple(&mut rng, want);
                for member in &chosen {
                    members.remove(member);
                }
                Ok(chosen)
            }
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .unwrap_or_default();
    shard.delete_if_empty(&args[1]);

    Ok(match count {
        // Without a count the reply is a single bulk (or nil).
        None => match popped.into_iter().next() {
            Some(member) => resp::bulk(&member),
            None => resp::null_bulk(),
        },
        Some(_) => resp::array(popped),
    })
}

pub fn srandmember(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    if args.len() != 2 && args.len() != 3 {
        return Err(RudisError::WrongArity("SRANDMEMBER".to_string()));
    }
    let members: Vec<Bytes> = read_set(shard, &args[1])?.into_iter().collect();
    let mut rng = rand::thread_rng();

    let Some(token) = args.get(2) else {
        return Ok(match members.iter().choose(&mut rng) {
            Some(member) => resp::bulk(member),
            None => resp::null_bulk(),
        });
    };

    let count = parse_int(token)?;
    if count >= 0 {
        // Positive count: distinct members via reservoir sampling.
        let chosen = members.into_iter().choose_multiple(&mut rng, count as usize);
        Ok(resp::array(chosen))
    } else if members.is_empty() {
        Ok(resp::array::<_, Bytes>([]))
    } else {
        // Negative count: sample with replacement.
        let draws = count.unsigned_abs() as usize;
        let chosen: Vec<Bytes> = (0..draws)
            .map(|_| members[rng.gen_range(0..members.len())].clone())
            .collect();
        Ok(resp::array(chosen))
    }
}

pub fn sinter(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    min_arity(args, 2, "SINTER")?;
    let mut result = read_set(shard, &args[1])?;
    for key in &args[2..] {
        let other = read_set(shard, key)?;
        result = result.intersection(&other).cloned().collect();
        if result.is_empty() {
            break;
        }
    }
    Ok(resp::array(result))
}

pub fn sunion(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    min_arity(args, 2, "SUNION")?;
    let mut result = BTreeSet::new();
    for key in &args[1..] {
        result.extend(read_set(shard, key)?);
    }
    Ok(resp::array(result))
}

pub fn sdiff(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    min_arity(args, 2, "SDIFF")?;
    let mut result = read_set(shard, &args[1])?;
    for key in &args[2..] {
        let other = read_set(shard, key)?;
        result = result.difference(&other).cloned().collect();
    }
    Ok(resp::array(result))
}

/// Clones a key's member set; absent keys read as the empty set.
fn read_set(shard: &Shard, key: &[u8]) -> RudisResult<BTreeSet<Bytes>> {
    Ok(shard
        .read(key, |value| match value {
            Value::Set(members) => Ok(members.clone()),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .unwrap_or_default())
}
