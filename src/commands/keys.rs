//! Generic key-space commands: existence, expiration, scanning.

use std::collections::HashMap;

use globset::Glob;

use crate::commands::{bulk, bulk_array, int, record_original, syntax_error};
use crate::db::command::{
    no_keys, read_all_keys, read_first_key, write_all_keys, write_first_key, CommandSpec, ExecCtx,
};
use crate::db::database::{now_ms, Database};
use crate::resp::{make_cmd_line, RespValue};

pub fn register(table: &mut HashMap<String, CommandSpec>) {
    let specs = vec![
        CommandSpec {
            name: "del",
            arity: -2,
            write: true,
            handler: del,
            prepare: write_all_keys,
        },
        CommandSpec {
            name: "exists",
            arity: -2,
            write: false,
            handler: exists,
            prepare: read_all_keys,
        },
        CommandSpec {
            name: "type",
            arity: 2,
            write: false,
            handler: type_command,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "expire",
            arity: 3,
            write: true,
            handler: expire,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "expireat",
            arity: 3,
            write: true,
            handler: expire_at,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "pexpire",
            arity: 3,
            write: true,
            handler: pexpire,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "pexpireat",
            arity: 3,
            write: true,
            handler: pexpire_at,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "ttl",
            arity: 2,
            write: false,
            handler: ttl,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "pttl",
            arity: 2,
            write: false,
            handler: pttl,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "persist",
            arity: 2,
            write: true,
            handler: persist,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "keys",
            arity: 2,
            write: false,
            handler: keys,
            prepare: no_keys,
        },
        CommandSpec {
            name: "scan",
            arity: -2,
            write: false,
            handler: scan,
            prepare: no_keys,
        },
        CommandSpec {
            name: "rename",
            arity: 3,
            write: true,
            handler: rename,
            prepare: write_all_keys,
        },
        CommandSpec {
            name: "dbsize",
            arity: 1,
            write: false,
            handler: dbsize,
            prepare: no_keys,
        },
        CommandSpec {
            name: "flushdb",
            arity: 1,
            write: true,
            handler: flushdb,
            prepare: no_keys,
        },
    ];
    for spec in specs {
        crate::db::command::register(table, spec);
    }
}

fn del(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let mut removed = Vec::new();
    for key in args {
        if db.remove_key(key) {
            removed.push(key.clone());
        }
    }
    if !removed.is_empty() {
        record_original(ctx, "DEL", &removed);
    }
    int(removed.len() as i64)
}

fn exists(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let count = args.iter().filter(|key| db.exists(key)).count();
    int(count as i64)
}

fn type_command(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match db.with_entity(&args[0], |entity| entity.type_name()) {
        Some(name) => RespValue::SimpleString(name.to_string()),
        None => RespValue::SimpleString("none".to_string()),
    }
}

fn expire_generic(db: &Database, ctx: &mut ExecCtx, key: &str, at_ms: i64) -> RespValue {
    if !db.exists(key) {
        return int(0);
    }
    db.expire_at(key, at_ms);
    // Relative expirations are logged in absolute form.
    ctx.record(make_cmd_line("PEXPIREAT", &[key, &at_ms.to_string()]));
    int(1)
}

fn expire(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(seconds) = args[1].parse::<i64>() else {
        return super::not_integer();
    };
    expire_generic(db, ctx, &args[0], now_ms() + seconds * 1000)
}

fn expire_at(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(at_seconds) = args[1].parse::<i64>() else {
        return super::not_integer();
    };
    expire_generic(db, ctx, &args[0], at_seconds * 1000)
}

fn pexpire(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(ms) = args[1].parse::<i64>() else {
        return super::not_integer();
    };
    expire_generic(db, ctx, &args[0], now_ms() + ms)
}

fn pexpire_at(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(at_ms) = args[1].parse::<i64>() else {
        return super::not_integer();
    };
    expire_generic(db, ctx, &args[0], at_ms)
}

fn ttl(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    if !db.exists(&args[0]) {
        return int(-2);
    }
    match db.ttl_at(&args[0]) {
        Some(at_ms) => int((at_ms - now_ms()) / 1000),
        None => int(-1),
    }
}

fn pttl(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    if !db.exists(&args[0]) {
        return int(-2);
    }
    match db.ttl_at(&args[0]) {
        Some(at_ms) => int(at_ms - now_ms()),
        None => int(-1),
    }
}

fn persist(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    if !db.exists(&args[0]) {
        return int(0);
    }
    if db.persist(&args[0]) {
        record_original(ctx, "PERSIST", args);
        return int(1);
    }
    int(0)
}

fn keys(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let pattern = &args[0];
    let matcher = match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher(),
        Err(_) => return RespValue::Error("ERR invalid pattern".to_string()),
    };
    let mut result = Vec::new();
    db.for_each(|key, _, _| {
        if pattern == "*" || matcher.is_match(key) {
            result.push(key.to_string());
        }
        true
    });
    bulk_array(result)
}

fn scan(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(cursor) = args[0].parse::<usize>() else {
        return RespValue::Error("ERR invalid cursor".to_string());
    };
    let mut pattern = "*".to_string();
    let mut count = 10usize;
    let mut i = 1;
    while i < args.len() {
        match args[i].to_lowercase().as_str() {
            "match" if i + 1 < args.len() => {
                pattern = args[i + 1].clone();
                i += 2;
            }
            "count" if i + 1 < args.len() => {
                let Ok(parsed) = args[i + 1].parse::<usize>() else {
                    return super::not_integer();
                };
                count = parsed;
                i += 2;
            }
            _ => return syntax_error(),
        }
    }
    let (batch, next_cursor) = db.scan(cursor, count, &pattern);
    if next_cursor == -1 {
        return RespValue::Error("ERR invalid pattern".to_string());
    }
    RespValue::Array(vec![bulk(next_cursor.to_string()), bulk_array(batch)])
}

fn rename(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let (src, dest) = (&args[0], &args[1]);
    let Some(entity) = db.get_entity_clone(src) else {
        return RespValue::Error("ERR no such key".to_string());
    };
    let ttl_at = db.ttl_at(src);
    db.remove_key(src);
    db.put_entity(dest, entity);
    match ttl_at {
        Some(at_ms) => db.expire_at(dest, at_ms),
        None => {
            db.persist(dest);
        }
    }
    record_original(ctx, "RENAME", args);
    RespValue::ok()
}

fn dbsize(db: &Database, _ctx: &mut ExecCtx, _args: &[String]) -> RespValue {
    int(db.len() as i64)
}

fn flushdb(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    db.flush();
    record_original(ctx, "FLUSHDB", args);
    RespValue::ok()
}
