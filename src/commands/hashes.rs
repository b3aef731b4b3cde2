//! Hash commands over a field-value map.

use std::collections::HashMap;

use globset::Glob;

use crate::commands::{bulk, bulk_array, int, not_float, not_integer, record_original, wrong_type};
use crate::db::command::{read_first_key, write_first_key, CommandSpec, ExecCtx};
use crate::db::database::Database;
use crate::db::entity::DataEntity;
use crate::resp::RespValue;

pub fn register(table: &mut HashMap<String, CommandSpec>) {
    let specs = vec![
        CommandSpec {
            name: "hset",
            arity: -4,
            write: true,
            handler: hset,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "hsetnx",
            arity: 4,
            write: true,
            handler: hsetnx,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "hget",
            arity: 3,
            write: false,
            handler: hget,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "hexists",
            arity: 3,
            write: false,
            handler: hexists,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "hdel",
            arity: -3,
            write: true,
            handler: hdel,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "hlen",
            arity: 2,
            write: false,
            handler: hlen,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "hstrlen",
            arity: 3,
            write: false,
            handler: hstrlen,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "hmget",
            arity: -3,
            write: false,
            handler: hmget,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "hmset",
            arity: -4,
            write: true,
            handler: hmset,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "hkeys",
            arity: 2,
            write: false,
            handler: hkeys,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "hvals",
            arity: 2,
            write: false,
            handler: hvals,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "hgetall",
            arity: 2,
            write: false,
            handler: hgetall,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "hincrby",
            arity: 4,
            write: true,
            handler: hincrby,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "hincrbyfloat",
            arity: 4,
            write: true,
            handler: hincrbyfloat,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "hscan",
            arity: -3,
            write: false,
            handler: hscan,
            prepare: read_first_key,
        },
    ];
    for spec in specs {
        crate::db::command::register(table, spec);
    }
}

fn with_hash<R>(
    db: &Database,
    key: &str,
    f: impl FnOnce(&HashMap<String, String>) -> R,
) -> Result<Option<R>, RespValue> {
    match db.with_entity(key, |entity| match entity {
        DataEntity::Hash(hash) => Ok(f(hash)),
        _ => Err(wrong_type()),
    }) {
        Some(Ok(result)) => Ok(Some(result)),
        Some(Err(reply)) => Err(reply),
        None => Ok(None),
    }
}

fn with_hash_mut<R>(
    db: &Database,
    key: &str,
    f: impl FnOnce(&mut HashMap<String, String>) -> R,
) -> Result<Option<R>, RespValue> {
    match db.with_entity_mut(key, |entity| match entity {
        DataEntity::Hash(hash) => Ok(f(hash)),
        _ => Err(wrong_type()),
    }) {
        Some(Ok(result)) => Ok(Some(result)),
        Some(Err(reply)) => Err(reply),
        None => Ok(None),
    }
}

fn hset(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    if args.len() % 2 != 1 {
        return RespValue::Error("ERR wrong number of arguments for 'hset' command".to_string());
    }
    let pairs: Vec<(String, String)> = args[1..]
        .chunks(2)
        .map(|chunk| (chunk[0].clone(), chunk[1].clone()))
        .collect();
    let apply = |hash: &mut HashMap<String, String>| {
        let mut added = 0;
        for (field, value) in &pairs {
            if hash.insert(field.clone(), value.clone()).is_none() {
                added += 1;
            }
        }
        added
    };
    let added = match with_hash_mut(db, &args[0], apply) {
        Ok(Some(added)) => added,
        Ok(None) => {
            let mut hash = HashMap::new();
            let added = pairs.len();
            for (field, value) in pairs {
                hash.insert(field, value);
            }
            db.put_entity(&args[0], DataEntity::Hash(hash));
            added
        }
        Err(reply) => return reply,
    };
    record_original(ctx, "HSET", args);
    int(added as i64)
}

fn hsetnx(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let (field, value) = (args[1].clone(), args[2].clone());
    let inserted = match with_hash_mut(db, &args[0], |hash| {
        if hash.contains_key(&field) {
            false
        } else {
            hash.insert(field.clone(), value.clone());
            true
        }
    }) {
        Ok(Some(inserted)) => inserted,
        Ok(None) => {
            let mut hash = HashMap::new();
            hash.insert(args[1].clone(), args[2].clone());
            db.put_entity(&args[0], DataEntity::Hash(hash));
            true
        }
        Err(reply) => return reply,
    };
    if inserted {
        record_original(ctx, "HSETNX", args);
    }
    int(i64::from(inserted))
}

fn hget(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match with_hash(db, &args[0], |hash| hash.get(&args[1]).cloned()) {
        Ok(Some(Some(value))) => bulk(value),
        Ok(_) => RespValue::Null,
        Err(reply) => reply,
    }
}

fn hexists(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match with_hash(db, &args[0], |hash| hash.contains_key(&args[1])) {
        Ok(Some(true)) => int(1),
        Ok(_) => int(0),
        Err(reply) => reply,
    }
}

fn hdel(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let result = with_hash_mut(db, &args[0], |hash| {
        let mut removed = 0;
        for field in &args[1..] {
            if hash.remove(field).is_some() {
                removed += 1;
            }
        }
        (removed, hash.is_empty())
    });
    match result {
        Ok(Some((removed, now_empty))) => {
            if now_empty {
                db.remove_key(&args[0]);
            }
            if removed > 0 {
                record_original(ctx, "HDEL", args);
            }
            int(removed)
        }
        Ok(None) => int(0),
        Err(reply) => reply,
    }
}

fn hlen(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match with_hash(db, &args[0], |hash| hash.len()) {
        Ok(Some(length)) => int(length as i64),
        Ok(None) => int(0),
        Err(reply) => reply,
    }
}

fn hstrlen(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match with_hash(db, &args[0], |hash| {
        hash.get(&args[1]).map(|value| value.len()).unwrap_or(0)
    }) {
        Ok(Some(length)) => int(length as i64),
        Ok(None) => int(0),
        Err(reply) => reply,
    }
}

fn hmget(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let result = with_hash(db, &args[0], |hash| {
        args[1..]
            .iter()
            .map(|field| hash.get(field).cloned())
            .collect::<Vec<_>>()
    });
    let values = match result {
        Ok(Some(values)) => values,
        Ok(None) => vec![None; args.len() - 1],
        Err(reply) => return reply,
    };
    RespValue::Array(
        values
            .into_iter()
            .map(|value| match value {
                Some(value) => RespValue::BulkString(value),
                None => RespValue::Null,
            })
            .collect(),
    )
}

fn hmset(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    if args.len() % 2 != 1 {
        return RespValue::Error("ERR wrong number of arguments for 'hmset' command".to_string());
    }
    match hset(db, ctx, args) {
        RespValue::Integer(_) => RespValue::ok(),
        other => other,
    }
}

fn hkeys(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match with_hash(db, &args[0], |hash| hash.keys().cloned().collect::<Vec<_>>()) {
        Ok(Some(keys)) => bulk_array(keys),
        Ok(None) => RespValue::Array(Vec::new()),
        Err(reply) => reply,
    }
}

fn hvals(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match with_hash(db, &args[0], |hash| hash.values().cloned().collect::<Vec<_>>()) {
        Ok(Some(values)) => bulk_array(values),
        Ok(None) => RespValue::Array(Vec::new()),
        Err(reply) => reply,
    }
}

fn hgetall(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let result = with_hash(db, &args[0], |hash| {
        let mut flat = Vec::with_capacity(hash.len() * 2);
        for (field, value) in hash {
            flat.push(field.clone());
            flat.push(value.clone());
        }
        flat
    });
    match result {
        Ok(Some(flat)) => bulk_array(flat),
        Ok(None) => RespValue::Array(Vec::new()),
        Err(reply) => reply,
    }
}

fn hincrby(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(delta) = args[2].parse::<i64>() else {
        return not_integer();
    };
    let field = args[1].clone();
    let result = with_hash_mut(db, &args[0], |hash| {
        let current: i64 = match hash.get(&field) {
            Some(value) => match value.parse() {
                Ok(parsed) => parsed,
                Err(_) => return Err(RespValue::Error(
                    "ERR hash value is not an integer".to_string(),
                )),
            },
            None => 0,
        };
        let Some(next) = current.checked_add(delta) else {
            return Err(RespValue::Error(
                "ERR increment or decrement would overflow".to_string(),
            ));
        };
        hash.insert(field.clone(), next.to_string());
        Ok(next)
    });
    let next = match result {
        Ok(Some(Ok(next))) => next,
        Ok(Some(Err(reply))) => return reply,
        Ok(None) => {
            let mut hash = HashMap::new();
            hash.insert(args[1].clone(), delta.to_string());
            db.put_entity(&args[0], DataEntity::Hash(hash));
            delta
        }
        Err(reply) => return reply,
    };
    record_original(ctx, "HINCRBY", args);
    int(next)
}

fn hincrbyfloat(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(delta) = args[2].parse::<f64>() else {
        return not_float();
    };
    let field = args[1].clone();
    let result = with_hash_mut(db, &args[0], |hash| {
        let current: f64 = match hash.get(&field) {
            Some(value) => match value.parse() {
                Ok(parsed) => parsed,
                Err(_) => {
                    return Err(RespValue::Error("ERR hash value is not a float".to_string()))
                }
            },
            None => 0.0,
        };
        let next = current + delta;
        if next.is_nan() || next.is_infinite() {
            return Err(RespValue::Error(
                "ERR increment would produce NaN or Infinity".to_string(),
            ));
        }
        let rendered = next.to_string();
        hash.insert(field.clone(), rendered.clone());
        Ok(rendered)
    });
    let rendered = match result {
        Ok(Some(Ok(rendered))) => rendered,
        Ok(Some(Err(reply))) => return reply,
        Ok(None) => {
            let rendered = delta.to_string();
            let mut hash = HashMap::new();
            hash.insert(args[1].clone(), rendered.clone());
            db.put_entity(&args[0], DataEntity::Hash(hash));
            rendered
        }
        Err(reply) => return reply,
    };
    record_original(ctx, "HINCRBYFLOAT", args);
    bulk(rendered)
}

fn hscan(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(_cursor) = args[1].parse::<usize>() else {
        return RespValue::Error("ERR invalid cursor".to_string());
    };
    let mut pattern = "*".to_string();
    let mut i = 2;
    while i < args.len() {
        match args[i].to_lowercase().as_str() {
            "match" if i + 1 < args.len() => {
                pattern = args[i + 1].clone();
                i += 2;
            }
            "count" if i + 1 < args.len() => {
                if args[i + 1].parse::<usize>().is_err() {
                    return not_integer();
                }
                i += 2;
            }
            _ => return super::syntax_error(),
        }
    }
    let matcher = match Glob::new(&pattern) {
        Ok(glob) => glob.compile_matcher(),
        Err(_) => return RespValue::Error("ERR invalid pattern".to_string()),
    };
    let result = with_hash(db, &args[0], |hash| {
        let mut flat = Vec::new();
        for (field, value) in hash {
            if pattern == "*" || matcher.is_match(field) {
                flat.push(field.clone());
                flat.push(value.clone());
            }
        }
        flat
    });
    let flat = match result {
        Ok(Some(flat)) => flat,
        Ok(None) => Vec::new(),
        Err(reply) => return reply,
    };
    RespValue::Array(vec![bulk("0"), bulk_array(flat)])
}
