//! Connection-neutral utility commands.

use std::collections::HashMap;

use crate::commands::bulk;
use crate::db::command::{no_keys, CommandSpec, ExecCtx};
use crate::db::database::Database;
use crate::resp::RespValue;

pub fn register(table: &mut HashMap<String, CommandSpec>) {
    let specs = vec![
        CommandSpec {
            name: "ping",
            arity: -1,
            write: false,
            handler: ping,
            prepare: no_keys,
        },
        CommandSpec {
            name: "echo",
            arity: 2,
            write: false,
            handler: echo,
            prepare: no_keys,
        },
    ];
    for spec in specs {
        crate::db::command::register(table, spec);
    }
}

fn ping(_db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    match args.len() {
        0 => RespValue::SimpleString("PONG".to_string()),
        1 => bulk(args[0].clone()),
        _ => RespValue::Error("ERR wrong number of arguments for 'ping' command".to_string()),
    }
}

fn echo(_db: &Database, _ctx: &mut ExecCtx, args: &[String]) -> RespValue {
    bulk(args[0].clone())
}
