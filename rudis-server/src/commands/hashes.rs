//! Hash commands.

use bytes::Bytes;
use rudis_common::{RudisError, RudisResult};
use rudis_engine::{Shard, Value};

use super::{arity, min_arity, parse_int};
use crate::resp;

pub fn hset(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    if args.len() < 4 || args.len() % 2 != 0 {
        return Err(RudisError::WrongArity("HSET".to_string()));
    }
    let added = write_pairs(shard, &args[1], &args[2..])?;
    Ok(resp::integer(added))
}

pub fn hmset(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    if args.len() < 4 || args.len() % 2 != 0 {
        return Err(RudisError::WrongArity("HMSET".to_string()));
    }
    write_pairs(shard, &args[1], &args[2..])?;
    Ok(resp::simple("OK"))
}

fn write_pairs(shard: &Shard, key: &[u8], pairs: &[Vec<u8>]) -> RudisResult<i64> {
    shard.write_or_insert(
        Bytes::copy_from_slice(key),
        || Value::Hash(Default::default()),
        |value| match value {
            Value::Hash(fields) => {
                let mut added = 0i64;
                for pair in pairs.chunks(2) {
                    let field = Bytes::copy_from_slice(&pair[0]);
                    if fields.insert(field, Bytes::copy_from_slice(&pair[1])).is_none() {
                        added += 1;
                    }
                }
                Ok(added)
            }
            _ => Err(RudisError::WrongType),
        },
    )
}

pub fn hget(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 3, "HGET")?;
    let value = shard
        .read(&args[1], |value| match value {
            Value::Hash(fields) => Ok(fields.get(args[2].as_slice()).cloned()),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .flatten();
    Ok(match value {
        Some(data) => resp::bulk(&data),
        None => resp::null_bulk(),
    })
}

pub fn hdel(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    min_arity(args, 3, "HDEL")?;
    let removed = shard
        .write(&args[1], |value| match value {
            Value::Hash(fields) => {
                let mut removed = 0i64;
                for field in &args[2..] {
                    if fields.remove(field.as_slice()).is_some() {
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

pub fn hexists(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 3, "HEXISTS")?;
    let present = shard
        .read(&args[1], |value| match value {
            Value::Hash(fields) => Ok(fields.contains_key(args[2].as_slice())),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .unwrap_or(false);
    Ok(resp::integer(i64::from(present)))
}

pub fn hgetall(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "HGETALL")?;
    let mut pairs = sorted_fields(shard, &args[1])?;
    let flattened: Vec<Bytes> = pairs.drain(..).flat_map(|(f, v)| [f, v]).collect();
    Ok(resp::array(flattened))
}

pub fn hkeys(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "HKEYS")?;
    let fields: Vec<Bytes> = sorted_fields(shard, &args[1])?
        .into_iter()
        .map(|(field, _)| field)
        .collect();
    Ok(resp::array(fields))
}

pub fn hvals(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "HVALS")?;
    let values: Vec<Bytes> = sorted_fields(shard, &args[1])?
        .into_iter()
        .map(|(_, value)| value)
        .collect();
    Ok(resp::array(values))
}

pub fn hlen(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "HLEN")?;
    let len = shard
        .read(&args[1], |value| match value {
            Value::Hash(fields) => Ok(fields.len() as i64),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .unwrap_or(0);
    Ok(resp::integer(len))
}

pub fn hmget(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    min_arity(args, 3, "HMGET")?;
    let values: Vec<Option<Bytes>> = shard
        .read(&args[1], |value| match value {
            Value::Hash(fields) => Ok(args[2..]
                .iter()
                .map(|field| fields.get(field.as_slice()).cloned())
                .collect()),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .unwrap_or_else(|| vec![None; args.len() - 2]);

    // Mixed bulk/nil entries need a hand-rolled array frame.
    let mut reply = Vec::new();
    reply.push(b'*');
    reply.extend_from_slice(values.len().to_string().as_bytes());
    reply.extend_from_slice(b"\r\n");
    for value in values {
        match value {
            Some(data) => reply.extend_from_slice(&resp::bulk(&data)),
            None => reply.extend_from_slice(&resp::null_bulk()),
        }
    }
    Ok(reply)
}

pub fn hsetnx(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 4, "HSETNX")?;
    let set = shard.write_or_insert(
        Bytes::copy_from_slice(&args[1]),
        || Value::Hash(Default::default()),
        |value| match value {
            Value::Hash(fields) => {
                if fields.contains_key(args[2].as_slice()) {
                    Ok(false)
                } else {
                    fields.insert(
                        Bytes::copy_from_slice(&args[2]),
                        Bytes::copy_from_slice(&args[3]),
                    );
                    Ok(true)
                }
            }
            _ => Err(RudisError::WrongType),
        },
    )?;
    Ok(resp::integer(i64::from(set)))
}

pub fn hincrby(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 4, "HINCRBY")?;
    let delta = parse_int(&args[3])?;
    let next = shard.write_or_insert(
        Bytes::copy_from_slice(&args[1]),
        || Value::Hash(Default::default()),
        |value| match value {
            Value::Hash(fields) => {
                let current = match fields.get(args[2].as_slice()) {
                    Some(data) => parse_int(data)?,
                    None => 0,
                };
                let next = current.checked_add(delta).ok_or(RudisError::NotAnInteger)?;
                fields.insert(
                    Bytes::copy_from_slice(&args[2]),
                    Bytes::from(next.to_string()),
                );
                Ok(next)
            }
            _ => Err(RudisError::WrongType),
        },
    )?;
    Ok(resp::integer(next))
}

/// Field/value pairs sorted by field, for deterministic array replies.
fn sorted_fields(shard: &Shard, key: &[u8]) -> RudisResult<Vec<(Bytes, Bytes)>> {
    let mut pairs: Vec<(Bytes, Bytes)> = shard
        .read(key, |value| match value {
            Value::Hash(fields) => Ok(fields
                .iter()
                .map(|(f, v)| (f.clone(), v.clone()))
                .collect::<Vec<_>>()),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .unwrap_or_default();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(pairs)
}
