//! List commands over the paged quick list.

use std::collections::HashMap;

use crate::commands::{bulk, bulk_array, int, normalize_range, not_integer, record_original, syntax_error, wrong_type};
use crate::datastruct::quicklist::QuickList;
use crate::db::command::{read_first_key, write_first_key, CommandSpec, ExecCtx};
use crate::db::database::Database;
use crate::db::entity::DataEntity;
use crate::resp::RespValue;

pub fn register(table: &mut HashMap<String, CommandSpec>) {
    let specs = vec![
        CommandSpec {
            name: "lpush",
            arity: -3,
            write: true,
            handler: lpush,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "rpush",
            arity: -3,
            write: true,
            handler: rpush,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "lpushx",
            arity: -3,
            write: true,
            handler: lpushx,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "rpushx",
            arity: -3,
            write: true,
            handler: rpushx,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "lpop",
            arity: 2,
            write: true,
            handler: lpop,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "rpop",
            arity: 2,
            write: true,
            handler: rpop,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "lrem",
            arity: 4,
            write: true,
            handler: lrem,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "llen",
            arity: 2,
            write: false,
            handler: llen,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "lindex",
            arity: 3,
            write: false,
            handler: lindex,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "lset",
            arity: 4,
            write: true,
            handler: lset,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "lrange",
            arity: 4,
            write: false,
            handler: lrange,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "linsert",
            arity: 5,
            write: true,
            handler: linsert,
            prepare: write_first_key,
        },
    ];
    for spec in specs {
        crate::db::command::register(table, spec);
    }
}

/// Applies `f` to the list under `key`; `Ok(None)` when the key is absent,
/// `Err` carries WRONGTYPE.
fn with_list_mut<R>(
    db: &Database,
    key: &str,
    f: impl FnOnce(&mut QuickList<String>) -> R,
) -> Result<Option<R>, RespValue> {
    match db.with_entity_mut(key, |entity| match entity {
        DataEntity::List(list) => Ok(f(list)),
        _ => Err(wrong_type()),
    }) {
        Some(Ok(result)) => Ok(Some(result)),
        Some(Err(reply)) => Err(reply),
        None => Ok(None),
    }
}

fn with_list<R>(
    db: &Database,
    key: &str,
    f: impl FnOnce(&QuickList<String>) -> R,
) -> Result<Option<R>, RespValue> {
    match db.with_entity(key, |entity| match entity {
        DataEntity::List(list) => Ok(f(list)),
        _ => Err(wrong_type()),
    }) {
        Some(Ok(result)) => Ok(Some(result)),
        Some(Err(reply)) => Err(reply),
        None => Ok(None),
    }
}

fn push(db: &Database, ctx: &mut ExecCtx, args: &[String], left: bool, name: &str) -> RespValue {
    let key = &args[0];
    let values = &args[1..];
    let result = with_list_mut(db, key, |list| {
        for value in values {
            if left {
                list.insert(0, value.clone());
            } else {
                list.add(value.clone());
            }
        }
        list.len()
    });
    let length = match result {
        Ok(Some(length)) => length,
        Ok(None) => {
            let mut list = QuickList::new();
            for value in values {
                if left {
                    list.insert(0, value.clone());
                } else {
                    list.add(value.clone());
                }
            }
            let length = list.len();
            db.put_entity(key, DataEntity::List(list));
            length
        }
        Err(reply) => return reply,
    };
    record_original(ctx, name, args);
    int(length as i64)
}

fn lpush(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    push(db, ctx, args, true, "LPUSH")
}

fn rpush(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    push(db, ctx, args, false, "RPUSH")
}

fn pushx(db: &Database, ctx: &mut ExecCtx, args: &[String], left: bool, name: &str) -> RespValue {
    let result = with_list_mut(db, &args[0], |list| {
        for value in &args[1..] {
            if left {
                list.insert(0, value.clone());
            } else {
                list.add(value.clone());
            }
        }
        list.len()
    });
    match result {
        Ok(Some(length)) => {
            record_original(ctx, name, args);
            int(length as i64)
        }
        Ok(None) => int(0),
        Err(reply) => reply,
    }
}

fn lpushx(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    pushx(db, ctx, args, true, "LPUSHX")
}

fn rpushx(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    pushx(db, ctx, args, false, "RPUSHX")
}

fn pop(db: &Database, ctx: &mut ExecCtx, args: &[String], left: bool, name: &str) -> RespValue {
    let result = with_list_mut(db, &args[0], |list| {
        let value = if left {
            if list.is_empty() {
                None
            } else {
                Some(list.remove(0))
            }
        } else {
            list.remove_last()
        };
        (value, list.is_empty())
    });
    match result {
        Ok(Some((Some(value), now_empty))) => {
            if now_empty {
                db.remove_key(&args[0]);
            }
            record_original(ctx, name, args);
            bulk(value)
        }
        Ok(Some((None, _))) | Ok(None) => RespValue::Null,
        Err(reply) => reply,
    }
}

fn lpop(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    pop(db, ctx, args, true, "LPOP")
}

fn rpop(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    pop(db, ctx, args, false, "RPOP")
}

fn lrem(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(count) = args[1].parse::<i64>() else {
        return not_integer();
    };
    let target = args[2].clone();
    let result = with_list_mut(db, &args[0], |list| {
        let removed = if count > 0 {
            list.remove_by_val(|v| *v == target, count as usize)
        } else if count < 0 {
            list.reverse_remove_by_val(|v| *v == target, count.unsigned_abs() as usize)
        } else {
            list.remove_all_by_val(|v| *v == target)
        };
        (removed, list.is_empty())
    });
    match result {
        Ok(Some((removed, now_empty))) => {
            if now_empty {
                db.remove_key(&args[0]);
            }
            if removed > 0 {
                record_original(ctx, "LREM", args);
            }
            int(removed as i64)
        }
        Ok(None) => int(0),
        Err(reply) => reply,
    }
}

fn llen(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match with_list(db, &args[0], |list| list.len()) {
        Ok(Some(length)) => int(length as i64),
        Ok(None) => int(0),
        Err(reply) => reply,
    }
}

fn lindex(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(index) = args[1].parse::<i64>() else {
        return not_integer();
    };
    let result = with_list(db, &args[0], |list| {
        let len = list.len() as i64;
        let index = if index < 0 { len + index } else { index };
        if index < 0 || index >= len {
            None
        } else {
            Some(list.get(index as usize).clone())
        }
    });
    match result {
        Ok(Some(Some(value))) => bulk(value),
        Ok(Some(None)) | Ok(None) => RespValue::Null,
        Err(reply) => reply,
    }
}

fn lset(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(index) = args[1].parse::<i64>() else {
        return not_integer();
    };
    let value = args[2].clone();
    let result = with_list_mut(db, &args[0], |list| {
        let len = list.len() as i64;
        let index = if index < 0 { len + index } else { index };
        if index < 0 || index >= len {
            false
        } else {
            list.set(index as usize, value);
            true
        }
    });
    match result {
        Ok(Some(true)) => {
            record_original(ctx, "LSET", args);
            RespValue::ok()
        }
        Ok(Some(false)) => RespValue::Error("ERR index out of range".to_string()),
        Ok(None) => RespValue::Error("ERR no such key".to_string()),
        Err(reply) => reply,
    }
}

fn lrange(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let (Ok(start), Ok(stop)) = (args[1].parse::<i64>(), args[2].parse::<i64>()) else {
        return not_integer();
    };
    let result = with_list(db, &args[0], |list| {
        match normalize_range(start, stop, list.len()) {
            Some((begin, end)) => list.range(begin, end),
            None => Vec::new(),
        }
    });
    match result {
        Ok(Some(values)) => bulk_array(values),
        Ok(None) => RespValue::Array(Vec::new()),
        Err(reply) => reply,
    }
}

fn linsert(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let before = match args[1].to_uppercase().as_str() {
        "BEFORE" => true,
        "AFTER" => false,
        _ => return syntax_error(),
    };
    let pivot = args[2].clone();
    let value = args[3].clone();
    let result = with_list_mut(db, &args[0], |list| {
        let mut pivot_index = None;
        list.for_each(|index, candidate| {
            if *candidate == pivot {
                pivot_index = Some(index);
                return false;
            }
            true
        });
        match pivot_index {
            Some(index) => {
                let at = if before { index } else { index + 1 };
                list.insert(at, value);
                Some(list.len())
            }
            None => None,
        }
    });
    match result {
        Ok(Some(Some(length))) => {
            record_original(ctx, "LINSERT", args);
            int(length as i64)
        }
        Ok(Some(None)) => int(-1),
        Ok(None) => int(0),
        Err(reply) => reply,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::command::ExecCtx;

    fn exec(db: &Database, name: &str, args: &[&str]) -> RespValue {
        let spec = crate::db::command::lookup(name).unwrap();
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let mut ctx = ExecCtx::new();
        (spec.handler)(db, &mut ctx, &args)
    }

    #[test]
    fn test_push_pop_flow() {
        let db = Database::new(0);
        assert_eq!(exec(&db, "rpush", &["l", "x", "y", "z"]), RespValue::Integer(3));
        assert_eq!(exec(&db, "lpush", &["l", "w"]), RespValue::Integer(4));
        assert_eq!(
            exec(&db, "lrange", &["l", "0", "-1"]),
            crate::commands::bulk_array(vec![
                "w".to_string(),
                "x".to_string(),
                "y".to_string(),
                "z".to_string()
            ])
        );
        assert_eq!(exec(&db, "lpop", &["l"]), RespValue::BulkString("w".to_string()));
        assert_eq!(exec(&db, "rpop", &["l"]), RespValue::BulkString("z".to_string()));
        assert_eq!(exec(&db, "llen", &["l"]), RespValue::Integer(2));
    }

    #[test]
    fn test_pop_to_empty_removes_key() {
        let db = Database::new(0);
        exec(&db, "rpush", &["l", "only"]);
        assert_eq!(exec(&db, "lpop", &["l"]), RespValue::BulkString("only".to_string()));
        assert!(!db.exists("l"));
        assert_eq!(exec(&db, "lpop", &["l"]), RespValue::Null);
    }

    #[test]
    fn test_linsert() {
        let db = Database::new(0);
        exec(&db, "rpush", &["l", "x", "y", "z"]);
        assert_eq!(
            exec(&db, "linsert", &["l", "BEFORE", "y", "m"]),
            RespValue::Integer(4)
        );
        assert_eq!(
            exec(&db, "lrange", &["l", "0", "-1"]),
            crate::commands::bulk_array(vec![
                "x".to_string(),
                "m".to_string(),
                "y".to_string(),
                "z".to_string()
            ])
        );
        assert_eq!(
            exec(&db, "linsert", &["l", "AFTER", "zzz", "m"]),
            RespValue::Integer(-1)
        );
        assert_eq!(
            exec(&db, "linsert", &["missing", "AFTER", "x", "m"]),
            RespValue::Integer(0)
        );
    }

    #[test]
    fn test_lrem_directions() {
        let db = Database::new(0);
        exec(&db, "rpush", &["l", "a", "b", "a", "c", "a"]);
        assert_eq!(exec(&db, "lrem", &["l", "1", "a"]), RespValue::Integer(1));
        assert_eq!(
            exec(&db, "lrange", &["l", "0", "-1"]),
            crate::commands::bulk_array(vec![
                "b".to_string(),
                "a".to_string(),
                "c".to_string(),
                "a".to_string()
            ])
        );
        assert_eq!(exec(&db, "lrem", &["l", "-1", "a"]), RespValue::Integer(1));
        assert_eq!(exec(&db, "lrem", &["l", "0", "a"]), RespValue::Integer(1));
    }

    #[test]
    fn test_wrong_type() {
        let db = Database::new(0);
        db.put_entity("s", crate::db::entity::DataEntity::Str("v".to_string()));
        assert!(exec(&db, "lpush", &["s", "x"]).is_error());
        assert!(exec(&db, "lrange", &["s", "0", "-1"]).is_error());
    }
}
