//! Command handlers, grouped by value family.
//!
//! Every handler takes the full unquoted argument vector (command name at
//! index 0), validates arity itself, and returns a ready-to-send reply frame
//! or a typed error for the dispatcher to render.

pub mod hashes;
pub mod keyspace;
pub mod lists;
pub mod server_info;
pub mod sets;
pub mod strings;
pub mod zsets;

use rudis_common::{RudisError, RudisResult};

pub(crate) fn arity(args: &[Vec<u8>], expected: usize, name: &str) -> RudisResult<()> {
    if args.len() != expected {
        return Err(RudisError::WrongArity(name.to_string()));
    }
    Ok(())
}

pub(crate) fn min_arity(args: &[Vec<u8>], at_least: usize, name: &str) -> RudisResult<()> {
    if args.len() < at_least {
        return Err(RudisError::WrongArity(name.to_string()));
    }
    Ok(())
}

pub(crate) fn parse_int(token: &[u8]) -> RudisResult<i64> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RudisError::NotAnInteger)
}

pub(crate) fn parse_float(token: &[u8]) -> RudisResult<f64> {
    let value: f64 = std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RudisError::NotAFloat)?;
    if value.is_nan() {
        return Err(RudisError::NotAFloat);
    }
    Ok(value)
}

/// Clamps a `start stop` pair (negative values count from the tail) to
/// concrete bounds, or `None` when the window is empty.
pub(crate) fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Resolves a possibly-negative element index against `len`.
pub(crate) fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { len + index } else { index };
    if (0..len).contains(&resolved) {
        Some(resolved as usize)
    } else {
        None
    }
}
