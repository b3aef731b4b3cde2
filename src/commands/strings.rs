//! String commands, including the bit-addressing subset.

use std::collections::HashMap;

use crate::commands::{bulk, int, not_float, not_integer, record_original, syntax_error, wrong_type};
use crate::datastruct::bitmap::Bitmap;
use crate::db::command::{read_first_key, write_first_key, CommandSpec, ExecCtx};
use crate::db::database::{now_ms, Database};
use crate::db::entity::DataEntity;
use crate::resp::{make_cmd_line, RespValue};

pub fn register(table: &mut HashMap<String, CommandSpec>) {
    let specs = vec![
        CommandSpec {
            name: "set",
            arity: -3,
            write: true,
            handler: set,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "setnx",
            arity: 3,
            write: true,
            handler: setnx,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "setex",
            arity: 4,
            write: true,
            handler: setex,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "psetex",
            arity: 4,
            write: true,
            handler: psetex,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "get",
            arity: 2,
            write: false,
            handler: get,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "getset",
            arity: 3,
            write: true,
            handler: getset,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "getdel",
            arity: 2,
            write: true,
            handler: getdel,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "incr",
            arity: 2,
            write: true,
            handler: incr,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "incrby",
            arity: 3,
            write: true,
            handler: incrby,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "decr",
            arity: 2,
            write: true,
            handler: decr,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "decrby",
            arity: 3,
            write: true,
            handler: decrby,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "incrbyfloat",
            arity: 3,
            write: true,
            handler: incrbyfloat,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "strlen",
            arity: 2,
            write: false,
            handler: strlen,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "append",
            arity: 3,
            write: true,
            handler: append,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "setbit",
            arity: 4,
            write: true,
            handler: setbit,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "getbit",
            arity: 3,
            write: false,
            handler: getbit,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "bitcount",
            arity: -2,
            write: false,
            handler: bitcount,
            prepare: read_first_key,
        },
    ];
    for spec in specs {
        crate::db::command::register(table, spec);
    }
}

/// Reads the string value; `Err` carries the WRONGTYPE reply.
fn get_string(db: &Database, key: &str) -> Result<Option<String>, RespValue> {
    match db.with_entity(key, |entity| match entity {
        DataEntity::Str(s) => Some(s.clone()),
        DataEntity::Bitmap(bitmap) => {
            Some(String::from_utf8_lossy(bitmap.as_bytes()).into_owned())
        }
        _ => None,
    }) {
        Some(Some(value)) => Ok(Some(value)),
        Some(None) => Err(wrong_type()),
        None => Ok(None),
    }
}

enum SetPolicy {
    Upsert,
    InsertOnly,
    UpdateOnly,
}

struct SetArguments {
    key: String,
    value: String,
    policy: SetPolicy,
    expire_at_ms: Option<i64>,
}

impl SetArguments {
    fn parse(args: &[String]) -> Result<SetArguments, RespValue> {
        let mut parsed = SetArguments {
            key: args[0].clone(),
            value: args[1].clone(),
            policy: SetPolicy::Upsert,
            expire_at_ms: None,
        };
        let mut i = 2;
        while i < args.len() {
            match args[i].to_uppercase().as_str() {
                "NX" => {
                    if matches!(parsed.policy, SetPolicy::UpdateOnly) {
                        return Err(syntax_error());
                    }
                    parsed.policy = SetPolicy::InsertOnly;
                    i += 1;
                }
                "XX" => {
                    if matches!(parsed.policy, SetPolicy::InsertOnly) {
                        return Err(syntax_error());
                    }
                    parsed.policy = SetPolicy::UpdateOnly;
                    i += 1;
                }
                "EX" | "PX" => {
                    if parsed.expire_at_ms.is_some() || i + 1 >= args.len() {
                        return Err(syntax_error());
                    }
                    let Ok(amount) = args[i + 1].parse::<i64>() else {
                        return Err(not_integer());
                    };
                    if amount <= 0 {
                        return Err(RespValue::Error(
                            "ERR invalid expire time in 'set' command".to_string(),
                        ));
                    }
                    let ms = if args[i].to_uppercase() == "EX" {
                        amount * 1000
                    } else {
                        amount
                    };
                    parsed.expire_at_ms = Some(now_ms() + ms);
                    i += 2;
                }
                _ => return Err(syntax_error()),
            }
        }
        Ok(parsed)
    }
}

fn set(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let parsed = match SetArguments::parse(args) {
        Ok(parsed) => parsed,
        Err(reply) => return reply,
    };
    let entity = DataEntity::Str(parsed.value.clone());
    let applied = match parsed.policy {
        SetPolicy::Upsert => {
            db.put_entity(&parsed.key, entity);
            true
        }
        SetPolicy::InsertOnly => db.put_if_absent_entity(&parsed.key, entity) > 0,
        SetPolicy::UpdateOnly => db.put_if_exists_entity(&parsed.key, entity) > 0,
    };
    if !applied {
        return RespValue::Null;
    }
    ctx.record(make_cmd_line("SET", &[&parsed.key, &parsed.value]));
    match parsed.expire_at_ms {
        Some(at_ms) => {
            db.expire_at(&parsed.key, at_ms);
            ctx.record(make_cmd_line(
                "PEXPIREAT",
                &[&parsed.key, &at_ms.to_string()],
            ));
        }
        None => {
            // A plain SET clears any previous expiration.
            db.persist(&parsed.key);
        }
    }
    RespValue::ok()
}

fn setnx(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let inserted = db.put_if_absent_entity(&args[0], DataEntity::Str(args[1].clone()));
    if inserted > 0 {
        record_original(ctx, "SETNX", args);
    }
    int(inserted as i64)
}

fn set_with_ttl(
    db: &Database,
    ctx: &mut ExecCtx,
    key: &str,
    value: &str,
    ttl_ms: i64,
    command: &str,
) -> RespValue {
    if ttl_ms <= 0 {
        return RespValue::Error(format!(
            "ERR invalid expire time in '{}' command",
            command
        ));
    }
    db.put_entity(key, DataEntity::Str(value.to_string()));
    let at_ms = now_ms() + ttl_ms;
    db.expire_at(key, at_ms);
    ctx.record(make_cmd_line("SET", &[key, value]));
    ctx.record(make_cmd_line("PEXPIREAT", &[key, &at_ms.to_string()]));
    RespValue::ok()
}

fn setex(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(seconds) = args[1].parse::<i64>() else {
        return not_integer();
    };
    set_with_ttl(db, ctx, &args[0], &args[2], seconds * 1000, "setex")
}

fn psetex(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(ms) = args[1].parse::<i64>() else {
        return not_integer();
    };
    set_with_ttl(db, ctx, &args[0], &args[2], ms, "psetex")
}

fn get(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match get_string(db, &args[0]) {
        Ok(Some(value)) => bulk(value),
        Ok(None) => RespValue::Null,
        Err(reply) => reply,
    }
}

fn getset(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let old = match get_string(db, &args[0]) {
        Ok(old) => old,
        Err(reply) => return reply,
    };
    db.put_entity(&args[0], DataEntity::Str(args[1].clone()));
    db.persist(&args[0]);
    ctx.record(make_cmd_line("SET", &[&args[0], &args[1]]));
    match old {
        Some(value) => bulk(value),
        None => RespValue::Null,
    }
}

fn getdel(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let old = match get_string(db, &args[0]) {
        Ok(old) => old,
        Err(reply) => return reply,
    };
    if old.is_some() {
        db.remove_key(&args[0]);
        ctx.record(make_cmd_line("DEL", &[&args[0]]));
    }
    match old {
        Some(value) => bulk(value),
        None => RespValue::Null,
    }
}

fn incr_generic(db: &Database, ctx: &mut ExecCtx, key: &str, delta: i64) -> RespValue {
    let current = match get_string(db, key) {
        Ok(current) => current,
        Err(reply) => return reply,
    };
    let current: i64 = match current {
        Some(ref value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => return not_integer(),
        },
        None => 0,
    };
    let Some(next) = current.checked_add(delta) else {
        return RespValue::Error("ERR increment or decrement would overflow".to_string());
    };
    db.put_entity(key, DataEntity::Str(next.to_string()));
    ctx.record(make_cmd_line("SET", &[key, &next.to_string()]));
    int(next)
}

fn incr(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    incr_generic(db, ctx, &args[0], 1)
}

fn incrby(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(delta) = args[1].parse::<i64>() else {
        return not_integer();
    };
    incr_generic(db, ctx, &args[0], delta)
}

fn decr(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    incr_generic(db, ctx, &args[0], -1)
}

fn decrby(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(delta) = args[1].parse::<i64>() else {
        return not_integer();
    };
    incr_generic(db, ctx, &args[0], -delta)
}

fn incrbyfloat(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(delta) = args[1].parse::<f64>() else {
        return not_float();
    };
    let current = match get_string(db, &args[0]) {
        Ok(current) => current,
        Err(reply) => return reply,
    };
    let current: f64 = match current {
        Some(ref value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => return not_float(),
        },
        None => 0.0,
    };
    let next = current + delta;
    if next.is_nan() || next.is_infinite() {
        return RespValue::Error("ERR increment would produce NaN or Infinity".to_string());
    }
    let rendered = next.to_string();
    db.put_entity(&args[0], DataEntity::Str(rendered.clone()));
    ctx.record(make_cmd_line("SET", &[&args[0], &rendered]));
    bulk(rendered)
}

fn strlen(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match get_string(db, &args[0]) {
        Ok(Some(value)) => int(value.len() as i64),
        Ok(None) => int(0),
        Err(reply) => reply,
    }
}

fn append(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let current = match get_string(db, &args[0]) {
        Ok(current) => current,
        Err(reply) => return reply,
    };
    let mut value = current.unwrap_or_default();
    value.push_str(&args[1]);
    let length = value.len();
    db.put_entity(&args[0], DataEntity::Str(value.clone()));
    ctx.record(make_cmd_line("SET", &[&args[0], &value]));
    int(length as i64)
}

/// Fetches the key as a bitmap, converting an existing plain string in
/// place. `Err` is WRONGTYPE.
fn with_bitmap_mut<R>(
    db: &Database,
    key: &str,
    f: impl FnOnce(&mut Bitmap) -> R,
) -> Result<Option<R>, RespValue> {
    let converted = db.with_entity_mut(key, |entity| match entity {
        DataEntity::Bitmap(bitmap) => Ok(Some(f(bitmap))),
        DataEntity::Str(s) => {
            let mut bitmap = Bitmap::from_bytes(s.clone().into_bytes());
            let result = f(&mut bitmap);
            *entity = DataEntity::Bitmap(bitmap);
            Ok(Some(result))
        }
        _ => Err(wrong_type()),
    });
    match converted {
        Some(result) => result,
        None => Ok(None),
    }
}

fn setbit(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(offset) = args[1].parse::<u64>() else {
        return RespValue::Error("ERR bit offset is not an integer or out of range".to_string());
    };
    let bit: u8 = match args[2].as_str() {
        "0" => 0,
        "1" => 1,
        _ => return RespValue::Error("ERR bit is not an integer or out of range".to_string()),
    };
    let previous = match with_bitmap_mut(db, &args[0], |bitmap| {
        let previous = bitmap.get_bit(offset);
        bitmap.set_bit(offset, bit);
        previous
    }) {
        Ok(Some(previous)) => previous,
        Ok(None) => {
            let mut bitmap = Bitmap::new();
            bitmap.set_bit(offset, bit);
            db.put_entity(&args[0], DataEntity::Bitmap(bitmap));
            0
        }
        Err(reply) => return reply,
    };
    record_original(ctx, "SETBIT", args);
    int(i64::from(previous))
}

fn getbit(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(offset) = args[1].parse::<u64>() else {
        return RespValue::Error("ERR bit offset is not an integer or out of range".to_string());
    };
    let bit = db.with_entity(&args[0], |entity| match entity {
        DataEntity::Bitmap(bitmap) => Ok(bitmap.get_bit(offset)),
        DataEntity::Str(s) => Ok(Bitmap::from_bytes(s.clone().into_bytes()).get_bit(offset)),
        _ => Err(wrong_type()),
    });
    match bit {
        Some(Ok(bit)) => int(i64::from(bit)),
        Some(Err(reply)) => reply,
        None => int(0),
    }
}

fn bitcount(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    if args.len() != 1 && args.len() != 3 {
        return syntax_error();
    }
    let bitmap = db.with_entity(&args[0], |entity| match entity {
        DataEntity::Bitmap(bitmap) => Ok(bitmap.clone()),
        DataEntity::Str(s) => Ok(Bitmap::from_bytes(s.clone().into_bytes())),
        _ => Err(wrong_type()),
    });
    let bitmap = match bitmap {
        Some(Ok(bitmap)) => bitmap,
        Some(Err(reply)) => return reply,
        None => return int(0),
    };
    let byte_len = bitmap.as_bytes().len() as i64;
    let (begin, end) = if args.len() == 3 {
        let (Ok(start), Ok(stop)) = (args[1].parse::<i64>(), args[2].parse::<i64>()) else {
            return not_integer();
        };
        match super::normalize_range(start, stop, byte_len as usize) {
            Some(window) => window,
            None => return int(0),
        }
    } else {
        (0, byte_len as usize)
    };
    let mut ones = 0i64;
    bitmap.for_each_byte(begin, end, |_, byte| {
        ones += i64::from(byte.count_ones() as u8);
        true
    });
    int(ones)
}
