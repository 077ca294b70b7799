//! List commands.

use bytes::Bytes;
use rudis_common::{RudisError, RudisResult};
use rudis_engine::{Shard, Value};

use super::{arity, min_arity, normalize_range, parse_int, resolve_index};
use crate::resp;

pub fn lpush(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    push(shard, args, true, "LPUSH")
}

pub fn rpush(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    push(shard, args, false, "RPUSH")
}

fn push(shard: &Shard, args: &[Vec<u8>], front: bool, name: &str) -> RudisResult<Vec<u8>> {
    min_arity(args, 3, name)?;
    let len = shard.write_or_insert(
        Bytes::copy_from_slice(&args[1]),
        || Value::List(Default::default()),
        |value| match value {
            Value::List(items) => {
                for arg in &args[2..] {
                    let item = Bytes::copy_from_slice(arg);
                    if front {
                        items.push_front(item);
                    } else {
                        items.push_back(item);
                    }
                }
                Ok(items.len() as i64)
            }
            _ => Err(RudisError::WrongType),
        },
    )?;
    Ok(resp::integer(len))
}

pub fn lpop(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    pop(shard, args, true, "LPOP")
}

pub fn rpop(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    pop(shard, args, false, "RPOP")
}

fn pop(shard: &Shard, args: &[Vec<u8>], front: bool, name: &str) -> RudisResult<Vec<u8>> {
    arity(args, 2, name)?;
    let popped = shard
        .write(&args[1], |value| match value {
            Value::List(items) => Ok(if front {
                items.pop_front()
            } else {
                items.pop_back()
            }),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .flatten();
    shard.delete_if_empty(&args[1]);
    Ok(match popped {
        Some(item) => resp::bulk(&item),
        None => resp::null_bulk(),
    })
}

pub fn llen(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "LLEN")?;
    let len = shard
        .read(&args[1], |value| match value {
            Value::List(items) => Ok(items.len() as i64),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .unwrap_or(0);
    Ok(resp::integer(len))
}

pub fn lrange(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 4, "LRANGE")?;
    let start = parse_int(&args[2])?;
    let stop = parse_int(&args[3])?;
    let items = shard
        .read(&args[1], |value| match value {
            Value::List(items) => match normalize_range(start, stop, items.len()) {
                Some((from, to)) => Ok(items
                    .iter()
                    .skip(from)
                    .take(to - from + 1)
                    .cloned()
                    .collect::<Vec<Bytes>>()),
                None => Ok(Vec::new()),
            },
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .unwrap_or_default();
    Ok(resp::array(items))
}

pub fn lindex(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 3, "LINDEX")?;
    let index = parse_int(&args[2])?;
    let item = shard
        .read(&args[1], |value| match value {
            Value::List(items) => Ok(resolve_index(index, items.len())
                .and_then(|i| items.get(i).cloned())),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .flatten();
    Ok(match item {
        Some(item) => resp::bulk(&item),
        None => resp::null_bulk(),
    })
}

pub fn lset(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 4, "LSET")?;
    let index = parse_int(&args[2])?;
    shard
        .write(&args[1], |value| match value {
            Value::List(items) => {
                let slot = resolve_index(index, items.len()).ok_or(RudisError::IndexOutOfRange)?;
                items[slot] = Bytes::copy_from_slice(&args[3]);
                Ok(())
            }
            _ => Err(RudisError::WrongType),
        })
        .ok_or(RudisError::NoSuchKey)??;
    Ok(resp::simple("OK"))
}

pub fn lrem(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 4, "LREM")?;
    let count = parse_int(&args[2])?;
    let target = args[3].as_slice();
    let removed = shard
        .write(&args[1], |value| match value {
            Value::List(items) => {
                let limit = count.unsigned_abs() as usize;
                let mut removed = 0usize;
                if count >= 0 {
                    let mut i = 0;
                    while i < items.len() {
                        if items[i].as_ref() == target && (count == 0 || removed < limit) {
                            items.remove(i);
                            removed += 1;
                        } else {
                            i += 1;
                        }
                    }
                } else {
                    let mut i = items.len();
                    while i > 0 {
                        i -= 1;
                        if items[i].as_ref() == target && removed < limit {
                            items.remove(i);
                            removed += 1;
                        }
                    }
                }
                Ok(removed as i64)
            }
            _ => Err(RudisError::WrongType),
        })
        .transpose()?
        .unwrap_or(0);
    shard.delete_if_empty(&args[1]);
    Ok(resp::integer(removed))
}
