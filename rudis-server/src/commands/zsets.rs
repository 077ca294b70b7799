//! Sorted-set commands.

use bytes::Bytes;
use rudis_common::{RudisError, RudisResult};
use rudis_engine::{Shard, SortedSet, Value};

use super::{arity, normalize_range, parse_float, parse_int};
use crate::resp;

pub fn zadd(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    if args.len() < 4 || args.len() % 2 != 0 {
        return Err(RudisError::WrongArity("ZADD".to_string()));
    }
    // Validate every score before mutating anything.
    let mut pairs = Vec::with_capacity((args.len() - 2) / 2);
    for chunk in args[2..].chunks(2) {
        let score = parse_float(&chunk[0])?;
        pairs.push((score, Bytes::copy_from_slice(&chunk[1])));
    }

    let added = shard.write_or_insert(
        Bytes::copy_from_slice(&args[1]),
        || Value::ZSet(SortedSet::new()),
        |value| match value {
            Value::ZSet(zset) => {
                let mut added = 0i64;
                for (score, member) in pairs.drain(..) {
                    if zset.insert(member, score) {
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

pub fn zcard(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "ZCARD")?;
    let len = shard
        .read(&args[1], |value| match value {
            Value::ZSet(zset) => Ok(zset.len() as i64),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .unwrap_or(0);
    Ok(resp::integer(len))
}

pub fn zcount(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 4, "ZCOUNT")?;
    let min = parse_float(&args[2])?;
    let max = parse_float(&args[3])?;
    let count = shard
        .read(&args[1], |value| match value {
            Value::ZSet(zset) => Ok(zset.count_in_range(min, max) as i64),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .unwrap_or(0);
    Ok(resp::integer(count))
}

pub fn zincrby(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 4, "ZINCRBY")?;
    let delta = parse_float(&args[2])?;
    let member = Bytes::copy_from_slice(&args[3]);
    let score = shard.write_or_insert(
        Bytes::copy_from_slice(&args[1]),
        || Value::ZSet(SortedSet::new()),
        |value| match value {
            Value::ZSet(zset) => Ok(zset.increment(member.clone(), delta)),
            _ => Err(RudisError::WrongType),
        },
    )?;
    Ok(resp::bulk(resp::format_score(score).as_bytes()))
}

pub fn zrange(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    range(shard, args, false, "ZRANGE")
}

pub fn zrevrange(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    range(shard, args, true, "ZREVRANGE")
}

fn range(shard: &Shard, args: &[Vec<u8>], rev: bool, name: &str) -> RudisResult<Vec<u8>> {
    let with_scores = match args.len() {
        4 => false,
        5 if args[4].eq_ignore_ascii_case(b"WITHSCORES") => true,
        _ => return Err(RudisError::WrongArity(name.to_string())),
    };
    let start = parse_int(&args[2])?;
    let stop = parse_int(&args[3])?;

    let window: Vec<(Bytes, f64)> = shard
        .read(&args[1], |value| match value {
            Value::ZSet(zset) => {
                let ordered: Vec<(Bytes, f64)> = if rev {
                    zset.iter_desc().map(|(m, s)| (m.clone(), s)).collect()
                } else {
                    zset.iter_asc().map(|(m, s)| (m.clone(), s)).collect()
                };
                Ok(match normalize_range(start, stop, ordered.len()) {
                    Some((from, to)) => ordered[from..=to].to_vec(),
                    None => Vec::new(),
                })
            }
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .unwrap_or_default();

    let items: Vec<Vec<u8>> = if with_scores {
        window
            .into_iter()
            .flat_map(|(member, score)| {
                [member.to_vec(), resp::format_score(score).into_bytes()]
            })
            .collect()
    } else {
        window.into_iter().map(|(member, _)| member.to_vec()).collect()
    };
    Ok(resp::array(items))
}

pub fn zrank(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    rank(shard, args, false, "ZRANK")
}

pub fn zrevrank(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    rank(shard, args, true, "ZREVRANK")
}

fn rank(shard: &Shard, args: &[Vec<u8>], rev: bool, name: &str) -> RudisResult<Vec<u8>> {
    arity(args, 3, name)?;
    let position = shard
        .read(&args[1], |value| match value {
            Value::ZSet(zset) => Ok(if rev {
                zset.rev_rank(&args[2])
            } else {
                zset.rank(&args[2])
            }),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .flatten();
    Ok(match position {
        Some(position) => resp::integer(position as i64),
        None => resp::null_bulk(),
    })
}

pub fn zrem(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    super::min_arity(args, 3, "ZREM")?;
    let removed = shard
        .write(&args[1], |value| match value {
            Value::ZSet(zset) => {
                let mut removed = 0i64;
                for member in &args[2..] {
                    if zset.remove(member) {
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

pub fn zscore(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 3, "ZSCORE")?;
    let score = shard
        .read(&args[1], |value| match value {
            Value::ZSet(zset) => Ok(zset.score(&args[2])),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .flatten();
    Ok(match score {
        Some(score) => resp::bulk(resp::format_score(score).as_bytes()),
        None => resp::null_bulk(),
    })
}
