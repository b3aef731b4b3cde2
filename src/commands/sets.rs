//! Set commands, including the store combinators.

use std::collections::HashMap;

use crate::commands::{bulk, bulk_array, int, not_integer, record_original, wrong_type};
use crate::datastruct::set::Set;
use crate::db::command::{
    read_all_keys, read_first_key, write_first_key, write_first_read_rest, CommandSpec, ExecCtx,
};
use crate::db::database::Database;
use crate::db::entity::DataEntity;
use crate::resp::{make_cmd_line, RespValue};

pub fn register(table: &mut HashMap<String, CommandSpec>) {
    let specs = vec![
        CommandSpec {
            name: "sadd",
            arity: -3,
            write: true,
            handler: sadd,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "sismember",
            arity: 3,
            write: false,
            handler: sismember,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "srem",
            arity: -3,
            write: true,
            handler: srem,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "spop",
            arity: -2,
            write: true,
            handler: spop,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "scard",
            arity: 2,
            write: false,
            handler: scard,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "smembers",
            arity: 2,
            write: false,
            handler: smembers,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "sinter",
            arity: -2,
            write: false,
            handler: sinter,
            prepare: read_all_keys,
        },
        CommandSpec {
            name: "sinterstore",
            arity: -3,
            write: true,
            handler: sinterstore,
            prepare: write_first_read_rest,
        },
        CommandSpec {
            name: "sunion",
            arity: -2,
            write: false,
            handler: sunion,
            prepare: read_all_keys,
        },
        CommandSpec {
            name: "sunionstore",
            arity: -3,
            write: true,
            handler: sunionstore,
            prepare: write_first_read_rest,
        },
        CommandSpec {
            name: "sdiff",
            arity: -2,
            write: false,
            handler: sdiff,
            prepare: read_all_keys,
        },
        CommandSpec {
            name: "sdiffstore",
            arity: -3,
            write: true,
            handler: sdiffstore,
            prepare: write_first_read_rest,
        },
        CommandSpec {
            name: "srandmember",
            arity: -2,
            write: false,
            handler: srandmember,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "sscan",
            arity: -3,
            write: false,
            handler: sscan,
            prepare: read_first_key,
        },
    ];
    for spec in specs {
        crate::db::command::register(table, spec);
    }
}

fn with_set<R>(db: &Database, key: &str, f: impl FnOnce(&Set) -> R) -> Result<Option<R>, RespValue> {
    match db.with_entity(key, |entity| match entity {
        DataEntity::Set(set) => Ok(f(set)),
        _ => Err(wrong_type()),
    }) {
        Some(Ok(result)) => Ok(Some(result)),
        Some(Err(reply)) => Err(reply),
        None => Ok(None),
    }
}

fn with_set_mut<R>(
    db: &Database,
    key: &str,
    f: impl FnOnce(&mut Set) -> R,
) -> Result<Option<R>, RespValue> {
    match db.with_entity_mut(key, |entity| match entity {
        DataEntity::Set(set) => Ok(f(set)),
        _ => Err(wrong_type()),
    }) {
        Some(Ok(result)) => Ok(Some(result)),
        Some(Err(reply)) => Err(reply),
        None => Ok(None),
    }
}

/// Reads every named set; missing keys count as empty sets.
fn load_sets(db: &Database, keys: &[String]) -> Result<Vec<Set>, RespValue> {
    let mut sets = Vec::with_capacity(keys.len());
    for key in keys {
        match with_set(db, key, |set| set.shallow_copy()) {
            Ok(Some(set)) => sets.push(set),
            Ok(None) => sets.push(Set::new()),
            Err(reply) => return Err(reply),
        }
    }
    Ok(sets)
}

fn sadd(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let members = &args[1..];
    let added = match with_set_mut(db, &args[0], |set| {
        members.iter().map(|member| set.add(member)).sum::<usize>()
    }) {
        Ok(Some(added)) => added,
        Ok(None) => {
            let mut set = Set::new();
            let added = members.iter().map(|member| set.add(member)).sum();
            db.put_entity(&args[0], DataEntity::Set(set));
            added
        }
        Err(reply) => return reply,
    };
    if added > 0 {
        record_original(ctx, "SADD", args);
    }
    int(added as i64)
}

fn sismember(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match with_set(db, &args[0], |set| set.has(&args[1])) {
        Ok(Some(true)) => int(1),
        Ok(_) => int(0),
        Err(reply) => reply,
    }
}

fn srem(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let result = with_set_mut(db, &args[0], |set| {
        let removed = args[1..]
            .iter()
            .map(|member| set.remove(member))
            .sum::<usize>();
        (removed, set.is_empty())
    });
    match result {
        Ok(Some((removed, now_empty))) => {
            if now_empty {
                db.remove_key(&args[0]);
            }
            if removed > 0 {
                record_original(ctx, "SREM", args);
            }
            int(removed as i64)
        }
        Ok(None) => int(0),
        Err(reply) => reply,
    }
}

fn spop(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let count = if args.len() == 2 {
        match args[1].parse::<usize>() {
            Ok(count) => Some(count),
            Err(_) => return not_integer(),
        }
    } else {
        None
    };
    let result = with_set_mut(db, &args[0], |set| {
        let take = count.unwrap_or(1);
        let popped = set.random_distinct_keys(take);
        for member in &popped {
            set.remove(member);
        }
        (popped, set.is_empty())
    });
    match result {
        Ok(Some((popped, now_empty))) => {
            if now_empty {
                db.remove_key(&args[0]);
            }
            if !popped.is_empty() {
                // The pop is random; the log records the members it chose.
                let mut srem_args: Vec<&str> = vec![&args[0]];
                srem_args.extend(popped.iter().map(|member| member.as_str()));
                ctx.record(make_cmd_line("SREM", &srem_args));
            }
            match count {
                Some(_) => bulk_array(popped),
                None => match popped.into_iter().next() {
                    Some(member) => bulk(member),
                    None => RespValue::Null,
                },
            }
        }
        Ok(None) => match count {
            Some(_) => RespValue::Array(Vec::new()),
            None => RespValue::Null,
        },
        Err(reply) => reply,
    }
}

fn scard(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match with_set(db, &args[0], |set| set.len()) {
        Ok(Some(length)) => int(length as i64),
        Ok(None) => int(0),
        Err(reply) => reply,
    }
}

fn smembers(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match with_set(db, &args[0], |set| set.to_slice()) {
        Ok(Some(members)) => bulk_array(members),
        Ok(None) => RespValue::Array(Vec::new()),
        Err(reply) => reply,
    }
}

fn combine(
    db: &Database,
    keys: &[String],
    combiner: impl FnOnce(&[&Set]) -> Set,
) -> Result<Set, RespValue> {
    let sets = load_sets(db, keys)?;
    let refs: Vec<&Set> = sets.iter().collect();
    Ok(combiner(&refs))
}

fn sinter(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match combine(db, args, Set::intersect) {
        Ok(result) => bulk_array(result.to_slice()),
        Err(reply) => reply,
    }
}

fn sunion(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match combine(db, args, Set::union) {
        Ok(result) => bulk_array(result.to_slice()),
        Err(reply) => reply,
    }
}

fn sdiff(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match combine(db, args, Set::diff) {
        Ok(result) => bulk_array(result.to_slice()),
        Err(reply) => reply,
    }
}

fn store_combined(
    db: &Database,
    ctx: &mut ExecCtx,
    name: &str,
    args: &[String],
    combiner: impl FnOnce(&[&Set]) -> Set,
) -> RespValue {
    let result = match combine(db, &args[1..], combiner) {
        Ok(result) => result,
        Err(reply) => return reply,
    };
    let length = result.len();
    if length == 0 {
        // An empty result deletes the destination.
        db.remove_key(&args[0]);
    } else {
        db.put_entity(&args[0], DataEntity::Set(result));
    }
    record_original(ctx, name, args);
    int(length as i64)
}

fn sinterstore(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    store_combined(db, ctx, "SINTERSTORE", args, Set::intersect)
}

fn sunionstore(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    store_combined(db, ctx, "SUNIONSTORE", args, Set::union)
}

fn sdiffstore(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    store_combined(db, ctx, "SDIFFSTORE", args, Set::diff)
}

fn srandmember(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let count = if args.len() == 2 {
        match args[1].parse::<i64>() {
            Ok(count) => Some(count),
            Err(_) => return not_integer(),
        }
    } else {
        None
    };
    let members = with_set(db, &args[0], |set| match count {
        None => set.random_distinct_keys(1),
        // Negative count samples with replacement.
        Some(count) if count < 0 => set.random_keys(count.unsigned_abs() as usize),
        Some(count) => set.random_distinct_keys(count as usize),
    });
    match members {
        Ok(Some(members)) => match count {
            None => match members.into_iter().next() {
                Some(member) => bulk(member),
                None => RespValue::Null,
            },
            Some(_) => bulk_array(members),
        },
        Ok(None) => match count {
            Some(_) => RespValue::Array(Vec::new()),
            None => RespValue::Null,
        },
        Err(reply) => reply,
    }
}

fn sscan(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
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
    let scanned = with_set(db, &args[0], |set| set.scan(&pattern));
    match scanned {
        Ok(Some((members, cursor))) => {
            if cursor == -1 {
                return RespValue::Error("ERR invalid pattern".to_string());
            }
            RespValue::Array(vec![bulk("0"), bulk_array(members)])
        }
        Ok(None) => RespValue::Array(vec![bulk("0"), RespValue::Array(Vec::new())]),
        Err(reply) => reply,
    }
}
