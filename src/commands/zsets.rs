//! Sorted-set commands: ranks, score ranges, pops.

use std::collections::HashMap;

use crate::commands::{bulk, bulk_array, int, normalize_range, not_float, not_integer, record_original, syntax_error, wrong_type};
use crate::datastruct::border::{parse_score_border, ScoreBorder};
use crate::datastruct::skiplist::Element;
use crate::datastruct::sortedset::SortedSet;
use crate::db::command::{read_first_key, write_first_key, CommandSpec, ExecCtx};
use crate::db::database::Database;
use crate::db::entity::DataEntity;
use crate::resp::RespValue;

pub fn register(table: &mut HashMap<String, CommandSpec>) {
    let specs = vec![
        CommandSpec {
            name: "zadd",
            arity: -4,
            write: true,
            handler: zadd,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "zscore",
            arity: 3,
            write: false,
            handler: zscore,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "zincrby",
            arity: 4,
            write: true,
            handler: zincrby,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "zcard",
            arity: 2,
            write: false,
            handler: zcard,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "zrank",
            arity: 3,
            write: false,
            handler: zrank,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "zrevrank",
            arity: 3,
            write: false,
            handler: zrevrank,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "zcount",
            arity: 4,
            write: false,
            handler: zcount,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "zrange",
            arity: -4,
            write: false,
            handler: zrange,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "zrevrange",
            arity: -4,
            write: false,
            handler: zrevrange,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "zrangebyscore",
            arity: -4,
            write: false,
            handler: zrangebyscore,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "zrevrangebyscore",
            arity: -4,
            write: false,
            handler: zrevrangebyscore,
            prepare: read_first_key,
        },
        CommandSpec {
            name: "zrem",
            arity: -3,
            write: true,
            handler: zrem,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "zremrangebyscore",
            arity: 4,
            write: true,
            handler: zremrangebyscore,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "zremrangebyrank",
            arity: 4,
            write: true,
            handler: zremrangebyrank,
            prepare: write_first_key,
        },
        CommandSpec {
            name: "zpopmin",
            arity: -2,
            write: true,
            handler: zpopmin,
            prepare: write_first_key,
        },
    ];
    for spec in specs {
        crate::db::command::register(table, spec);
    }
}

fn with_zset<R>(
    db: &Database,
    key: &str,
    f: impl FnOnce(&SortedSet) -> R,
) -> Result<Option<R>, RespValue> {
    match db.with_entity(key, |entity| match entity {
        DataEntity::SortedSet(zset) => Ok(f(zset)),
        _ => Err(wrong_type()),
    }) {
        Some(Ok(result)) => Ok(Some(result)),
        Some(Err(reply)) => Err(reply),
        None => Ok(None),
    }
}

fn with_zset_mut<R>(
    db: &Database,
    key: &str,
    f: impl FnOnce(&mut SortedSet) -> R,
) -> Result<Option<R>, RespValue> {
    match db.with_entity_mut(key, |entity| match entity {
        DataEntity::SortedSet(zset) => Ok(f(zset)),
        _ => Err(wrong_type()),
    }) {
        Some(Ok(result)) => Ok(Some(result)),
        Some(Err(reply)) => Err(reply),
        None => Ok(None),
    }
}

/// Scores render the way Redis prints them: no trailing `.0` on integers.
fn format_score(score: f64) -> String {
    score.to_string()
}

fn elements_reply(elements: Vec<Element>, with_scores: bool) -> RespValue {
    let mut flat = Vec::with_capacity(if with_scores {
        elements.len() * 2
    } else {
        elements.len()
    });
    for element in elements {
        flat.push(element.member);
        if with_scores {
            flat.push(format_score(element.score));
        }
    }
    bulk_array(flat)
}

fn parse_border_arg(arg: &str) -> Result<ScoreBorder, RespValue> {
    parse_score_border(arg).map_err(|err| RespValue::Error(err.to_string()))
}

fn zadd(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    if args.len() % 2 != 1 {
        return syntax_error();
    }
    let mut pairs = Vec::with_capacity(args.len() / 2);
    for chunk in args[1..].chunks(2) {
        let Ok(score) = chunk[0].parse::<f64>() else {
            return not_float();
        };
        pairs.push((score, chunk[1].clone()));
    }
    let added = match with_zset_mut(db, &args[0], |zset| {
        pairs
            .iter()
            .filter(|(score, member)| zset.add(member, *score))
            .count()
    }) {
        Ok(Some(added)) => added,
        Ok(None) => {
            let mut zset = SortedSet::new();
            let added = pairs
                .iter()
                .filter(|(score, member)| zset.add(member, *score))
                .count();
            db.put_entity(&args[0], DataEntity::SortedSet(zset));
            added
        }
        Err(reply) => return reply,
    };
    record_original(ctx, "ZADD", args);
    int(added as i64)
}

fn zscore(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match with_zset(db, &args[0], |zset| zset.get(&args[1])) {
        Ok(Some(Some(score))) => bulk(format_score(score)),
        Ok(_) => RespValue::Null,
        Err(reply) => reply,
    }
}

fn zincrby(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let Ok(delta) = args[1].parse::<f64>() else {
        return not_float();
    };
    let member = args[2].clone();
    let next = match with_zset_mut(db, &args[0], |zset| {
        let next = zset.get(&member).unwrap_or(0.0) + delta;
        zset.add(&member, next);
        next
    }) {
        Ok(Some(next)) => next,
        Ok(None) => {
            let mut zset = SortedSet::new();
            zset.add(&member, delta);
            db.put_entity(&args[0], DataEntity::SortedSet(zset));
            delta
        }
        Err(reply) => return reply,
    };
    record_original(ctx, "ZINCRBY", args);
    bulk(format_score(next))
}

fn zcard(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match with_zset(db, &args[0], |zset| zset.len()) {
        Ok(Some(length)) => int(length as i64),
        Ok(None) => int(0),
        Err(reply) => reply,
    }
}

fn rank_reply(rank: Option<Option<usize>>) -> RespValue {
    match rank {
        Some(Some(rank)) => int(rank as i64),
        _ => RespValue::Null,
    }
}

fn zrank(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match with_zset(db, &args[0], |zset| zset.rank(&args[1], false)) {
        Ok(rank) => rank_reply(rank),
        Err(reply) => reply,
    }
}

fn zrevrank(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match with_zset(db, &args[0], |zset| zset.rank(&args[1], true)) {
        Ok(rank) => rank_reply(rank),
        Err(reply) => reply,
    }
}

fn zcount(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let min = match parse_border_arg(&args[1]) {
        Ok(border) => border,
        Err(reply) => return reply,
    };
    let max = match parse_border_arg(&args[2]) {
        Ok(border) => border,
        Err(reply) => return reply,
    };
    match with_zset(db, &args[0], |zset| zset.range_count(&min, &max)) {
        Ok(Some(count)) => int(count as i64),
        Ok(None) => int(0),
        Err(reply) => reply,
    }
}

fn parse_with_scores(args: &[String]) -> Result<bool, RespValue> {
    match args.len() {
        0 => Ok(false),
        1 if args[0].to_uppercase() == "WITHSCORES" => Ok(true),
        _ => Err(syntax_error()),
    }
}

fn zrange_generic(db: &Database, args: &[String], desc: bool) -> RespValue {
    let (Ok(start), Ok(stop)) = (args[1].parse::<i64>(), args[2].parse::<i64>()) else {
        return not_integer();
    };
    let with_scores = match parse_with_scores(&args[3..]) {
        Ok(with_scores) => with_scores,
        Err(reply) => return reply,
    };
    let result = with_zset(db, &args[0], |zset| {
        match normalize_range(start, stop, zset.len()) {
            Some((begin, end)) => zset.range_by_rank(begin, end, desc),
            None => Vec::new(),
        }
    });
    match result {
        Ok(Some(elements)) => elements_reply(elements, with_scores),
        Ok(None) => RespValue::Array(Vec::new()),
        Err(reply) => reply,
    }
}

fn zrange(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    zrange_generic(db, args, false)
}

fn zrevrange(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    zrange_generic(db, args, true)
}

struct RangeByScoreArguments {
    min: ScoreBorder,
    max: ScoreBorder,
    with_scores: bool,
    offset: usize,
    limit: i64,
}

impl RangeByScoreArguments {
    /// Parses `min max [WITHSCORES] [LIMIT offset count]`; for the reversed
    /// form the caller passes `max min` already swapped.
    fn parse(min_arg: &str, max_arg: &str, rest: &[String]) -> Result<Self, RespValue> {
        let min = parse_border_arg(min_arg)?;
        let max = parse_border_arg(max_arg)?;
        let mut parsed = RangeByScoreArguments {
            min,
            max,
            with_scores: false,
            offset: 0,
            limit: -1,
        };
        let mut i = 0;
        while i < rest.len() {
            match rest[i].to_uppercase().as_str() {
                "WITHSCORES" => {
                    parsed.with_scores = true;
                    i += 1;
                }
                "LIMIT" => {
                    if i + 3 > rest.len() {
                        return Err(syntax_error());
                    }
                    let (Ok(offset), Ok(limit)) = (
                        rest[i + 1].parse::<usize>(),
                        rest[i + 2].parse::<i64>(),
                    ) else {
                        return Err(not_integer());
                    };
                    parsed.offset = offset;
                    parsed.limit = limit;
                    i += 3;
                }
                _ => return Err(syntax_error()),
            }
        }
        Ok(parsed)
    }
}

fn zrangebyscore(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let parsed = match RangeByScoreArguments::parse(&args[1], &args[2], &args[3..]) {
        Ok(parsed) => parsed,
        Err(reply) => return reply,
    };
    let result = with_zset(db, &args[0], |zset| {
        zset.range(&parsed.min, &parsed.max, parsed.offset, parsed.limit, false)
    });
    match result {
        Ok(Some(elements)) => elements_reply(elements, parsed.with_scores),
        Ok(None) => RespValue::Array(Vec::new()),
        Err(reply) => reply,
    }
}

fn zrevrangebyscore(db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    // ZREVRANGEBYSCORE key max min ...
    let parsed = match RangeByScoreArguments::parse(&args[2], &args[1], &args[3..]) {
        Ok(parsed) => parsed,
        Err(reply) => return reply,
    };
    let result = with_zset(db, &args[0], |zset| {
        zset.range(&parsed.min, &parsed.max, parsed.offset, parsed.limit, true)
    });
    match result {
        Ok(Some(elements)) => elements_reply(elements, parsed.with_scores),
        Ok(None) => RespValue::Array(Vec::new()),
        Err(reply) => reply,
    }
}

fn zrem(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let result = with_zset_mut(db, &args[0], |zset| {
        let removed = args[1..]
            .iter()
            .filter(|member| zset.remove(member))
            .count();
        (removed, zset.is_empty())
    });
    match result {
        Ok(Some((removed, now_empty))) => {
            if now_empty {
                db.remove_key(&args[0]);
            }
            if removed > 0 {
                record_original(ctx, "ZREM", args);
            }
            int(removed as i64)
        }
        Ok(None) => int(0),
        Err(reply) => reply,
    }
}

fn zremrangebyscore(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let min = match parse_border_arg(&args[1]) {
        Ok(border) => border,
        Err(reply) => return reply,
    };
    let max = match parse_border_arg(&args[2]) {
        Ok(border) => border,
        Err(reply) => return reply,
    };
    let result = with_zset_mut(db, &args[0], |zset| {
        let removed = zset.remove_range(&min, &max);
        (removed, zset.is_empty())
    });
    match result {
        Ok(Some((removed, now_empty))) => {
            if now_empty {
                db.remove_key(&args[0]);
            }
            if removed > 0 {
                record_original(ctx, "ZREMRANGEBYSCORE", args);
            }
            int(removed as i64)
        }
        Ok(None) => int(0),
        Err(reply) => reply,
    }
}

fn zremrangebyrank(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let (Ok(start), Ok(stop)) = (args[1].parse::<i64>(), args[2].parse::<i64>()) else {
        return not_integer();
    };
    let result = with_zset_mut(db, &args[0], |zset| {
        let removed = match normalize_range(start, stop, zset.len()) {
            Some((begin, end)) => zset.remove_by_rank(begin, end),
            None => 0,
        };
        (removed, zset.is_empty())
    });
    match result {
        Ok(Some((removed, now_empty))) => {
            if now_empty {
                db.remove_key(&args[0]);
            }
            if removed > 0 {
                record_original(ctx, "ZREMRANGEBYRANK", args);
            }
            int(removed as i64)
        }
        Ok(None) => int(0),
        Err(reply) => reply,
    }
}

fn zpopmin(db: &Database, ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    let count = if args.len() == 2 {
        match args[1].parse::<usize>() {
            Ok(count) => count,
            Err(_) => return not_integer(),
        }
    } else {
        1
    };
    if count == 0 {
        return RespValue::Array(Vec::new());
    }
    let result = with_zset_mut(db, &args[0], |zset| {
        let popped = zset.pop_min(count);
        (popped, zset.is_empty())
    });
    match result {
        Ok(Some((popped, now_empty))) => {
            if now_empty {
                db.remove_key(&args[0]);
            }
            if !popped.is_empty() {
                record_original(ctx, "ZPOPMIN", args);
            }
            elements_reply(popped, true)
        }
        Ok(None) => RespValue::Array(Vec::new()),
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

    fn members(reply: RespValue) -> Vec<String> {
        let RespValue::Array(items) = reply else {
            panic!("expected array, got {:?}", reply);
        };
        items
            .into_iter()
            .map(|item| match item {
                RespValue::BulkString(s) => s,
                other => panic!("expected bulk string, got {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_zadd_zrange_withscores() {
        let db = Database::new(0);
        assert_eq!(
            exec(&db, "zadd", &["z", "1", "a", "2", "b", "3", "c"]),
            RespValue::Integer(3)
        );
        assert_eq!(
            members(exec(&db, "zrange", &["z", "0", "-1", "WITHSCORES"])),
            vec!["a", "1", "b", "2", "c", "3"]
        );
        // Updating a score is not a new member.
        assert_eq!(exec(&db, "zadd", &["z", "5", "a"]), RespValue::Integer(0));
        assert_eq!(
            members(exec(&db, "zrange", &["z", "0", "-1"])),
            vec!["b", "c", "a"]
        );
    }

    #[test]
    fn test_zrangebyscore_exclusive() {
        let db = Database::new(0);
        exec(&db, "zadd", &["z", "1", "a", "2", "b", "3", "c"]);
        assert_eq!(
            members(exec(&db, "zrangebyscore", &["z", "(1", "3"])),
            vec!["b", "c"]
        );
        assert_eq!(
            members(exec(&db, "zrevrangebyscore", &["z", "3", "(1"])),
            vec!["c", "b"]
        );
        assert_eq!(
            members(exec(
                &db,
                "zrangebyscore",
                &["z", "-inf", "+inf", "LIMIT", "1", "1"]
            )),
            vec!["b"]
        );
    }

    #[test]
    fn test_rank_and_count() {
        let db = Database::new(0);
        exec(&db, "zadd", &["z", "1", "a", "2", "b", "3", "c"]);
        assert_eq!(exec(&db, "zrank", &["z", "a"]), RespValue::Integer(0));
        assert_eq!(exec(&db, "zrevrank", &["z", "a"]), RespValue::Integer(2));
        assert_eq!(exec(&db, "zrank", &["z", "nope"]), RespValue::Null);
        assert_eq!(exec(&db, "zcount", &["z", "2", "+inf"]), RespValue::Integer(2));
        assert_eq!(exec(&db, "zcard", &["z"]), RespValue::Integer(3));
    }

    #[test]
    fn test_zpopmin_and_cleanup() {
        let db = Database::new(0);
        exec(&db, "zadd", &["z", "1", "a", "2", "b"]);
        assert_eq!(
            members(exec(&db, "zpopmin", &["z", "2"])),
            vec!["a", "1", "b", "2"]
        );
        assert!(!db.exists("z"), "empty zset key is removed");
    }

    #[test]
    fn test_zremrangebyrank() {
        let db = Database::new(0);
        exec(&db, "zadd", &["z", "1", "a", "2", "b", "3", "c", "4", "d"]);
        assert_eq!(
            exec(&db, "zremrangebyrank", &["z", "0", "1"]),
            RespValue::Integer(2)
        );
        assert_eq!(
            members(exec(&db, "zrange", &["z", "0", "-1"])),
            vec!["c", "d"]
        );
    }
}
