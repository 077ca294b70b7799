//! String commands.

use bytes::Bytes;
use rudis_common::{RudisError, RudisResult};
use rudis_engine::{Shard, Value};

use super::{arity, parse_int};
use crate::resp;

pub fn set(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 3, "SET")?;
    shard.set(
        Bytes::copy_from_slice(&args[1]),
        Value::Str(Bytes::copy_from_slice(&args[2])),
    );
    Ok(resp::simple("OK"))
}

pub fn get(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "GET")?;
    let value = shard
        .read(&args[1], |value| match value {
            Value::Str(data) => Ok(data.clone()),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?;
    Ok(match value {
        Some(data) => resp::bulk(&data),
        None => resp::null_bulk(),
    })
}

pub fn getset(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 3, "GETSET")?;
    let old = shard
        .read(&args[1], |value| match value {
            Value::Str(data) => Ok(data.clone()),
            _ => Err(RudisError::WrongType),
        })
        .transpose()?;
    shard.set(
        Bytes::copy_from_slice(&args[1]),
        Value::Str(Bytes::copy_from_slice(&args[2])),
    );
    Ok(match old {
        Some(data) => resp::bulk(&data),
        None => resp::null_bulk(),
    })
}

pub fn incr(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "INCR")?;
    add_to(shard, &args[1], 1)
}

pub fn incrby(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 3, "INCRBY")?;
    add_to(shard, &args[1], parse_int(&args[2])?)
}

pub fn decr(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 2, "DECR")?;
    add_to(shard, &args[1], -1)
}

pub fn decrby(shard: &Shard, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    arity(args, 3, "DECRBY")?;
    let delta = parse_int(&args[2])?;
    add_to(shard, &args[1], delta.checked_neg().ok_or(RudisError::NotAnInteger)?)
}

/// Shared body of the four counter commands. A missing key counts from zero;
/// a non-integer payload or an overflow is an argument-domain error.
fn add_to(shard: &Shard, key: &[u8], delta: i64) -> RudisResult<Vec<u8>> {
    let next = shard.write_or_insert(
        Bytes::copy_from_slice(key),
        || Value::Str(Bytes::from_static(b"0")),
        |value| match value {
            Value::Str(data) => {
                let current = parse_int(data)?;
                let next = current.checked_add(delta).ok_or(RudisError::NotAnInteger)?;
                *data = Bytes::from(next.to_string());
                Ok(next)
            }
            _ => Err(RudisError::WrongType),
        },
    )?;
    Ok(resp::integer(next))
}
