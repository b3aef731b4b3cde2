//! Command handlers, grouped by key type.
//!
//! Handlers run under the shard locks the dispatcher acquired from their
//! `prepare` key sets and never touch the lock table themselves. Mutating
//! handlers record the command lines that reproduce their effect via
//! [`crate::db::command::ExecCtx::record`]; relative expirations are always
//! recorded in absolute `PEXPIREAT` form so a later replay cannot shift them.

pub mod hashes;
pub mod keys;
pub mod lists;
pub mod sets;
pub mod strings;
pub mod sys;
pub mod zsets;

use crate::db::command::ExecCtx;
use crate::resp::{CmdLine, RespValue};

pub(crate) fn wrong_type() -> RespValue {
    RespValue::Error(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

pub(crate) fn syntax_error() -> RespValue {
    RespValue::Error("ERR syntax error".to_string())
}

pub(crate) fn not_integer() -> RespValue {
    RespValue::Error("ERR value is not an integer or out of range".to_string())
}

pub(crate) fn not_float() -> RespValue {
    RespValue::Error("ERR value is not a valid float".to_string())
}

pub(crate) fn bulk(s: impl Into<String>) -> RespValue {
    RespValue::BulkString(s.into())
}

pub(crate) fn int(value: i64) -> RespValue {
    RespValue::Integer(value)
}

pub(crate) fn bulk_array<I: IntoIterator<Item = String>>(items: I) -> RespValue {
    RespValue::Array(items.into_iter().map(RespValue::BulkString).collect())
}

/// Records the command as issued: `name` plus its original arguments.
pub(crate) fn record_original(ctx: &mut ExecCtx, name: &str, args: &[String]) {
    let mut line: CmdLine = Vec::with_capacity(args.len() + 1);
    line.push(name.to_string());
    line.extend(args.iter().cloned());
    ctx.record(line);
}

/// Maps a possibly negative Redis index pair onto `[0, len)`, returning an
/// inclusive-start/exclusive-stop window, or `None` for an empty range.
pub(crate) fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize + 1))
}
