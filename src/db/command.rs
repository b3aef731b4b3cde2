//! The command table.
//!
//! Every command registers a spec: its handler, an arity rule, whether it
//! mutates, and a `prepare` function that names the keys it will write and
//! read so the dispatcher can take the right shard locks before the handler
//! runs. Handlers never lock; they run entirely under the locks the
//! dispatcher acquired from the prepared key sets.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::db::database::Database;
use crate::resp::{CmdLine, RespValue};

/// Per-invocation scratch state handed to handlers. Mutating handlers record
/// the command lines that reproduce their effect; the dispatcher forwards
/// them to the append-only log after the handler succeeds.
#[derive(Default)]
pub struct ExecCtx {
    aof: Vec<CmdLine>,
}

impl ExecCtx {
    pub fn new() -> Self {
        ExecCtx::default()
    }

    /// Queues a command line for the append-only log.
    pub fn record(&mut self, cmd: CmdLine) {
        self.aof.push(cmd);
    }

    pub(crate) fn take_aof(&mut self) -> Vec<CmdLine> {
        std::mem::take(&mut self.aof)
    }
}

pub type CmdHandler = fn(&Database, &mut ExecCtx, &[String]) -> RespValue;
/// Computes `(write keys, read keys)` for a command's arguments.
pub type PrepareFn = fn(&[String]) -> (Vec<String>, Vec<String>);

pub struct CommandSpec {
    pub name: &'static str,
    /// Exact argument count including the name; negative means "at least".
    pub arity: i32,
    pub write: bool,
    pub handler: CmdHandler,
    pub prepare: PrepareFn,
}

impl CommandSpec {
    pub fn arity_matches(&self, arg_count_with_name: usize) -> bool {
        if self.arity >= 0 {
            arg_count_with_name == self.arity as usize
        } else {
            arg_count_with_name >= (-self.arity) as usize
        }
    }
}

pub fn no_keys(_args: &[String]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), Vec::new())
}

pub fn write_first_key(args: &[String]) -> (Vec<String>, Vec<String>) {
    (vec![args[0].clone()], Vec::new())
}

pub fn read_first_key(args: &[String]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), vec![args[0].clone()])
}

pub fn write_all_keys(args: &[String]) -> (Vec<String>, Vec<String>) {
    (args.to_vec(), Vec::new())
}

pub fn read_all_keys(args: &[String]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), args.to_vec())
}

/// First key written, the rest read: the store-combinator shape.
pub fn write_first_read_rest(args: &[String]) -> (Vec<String>, Vec<String>) {
    (vec![args[0].clone()], args[1..].to_vec())
}

fn command_table() -> &'static HashMap<String, CommandSpec> {
    static TABLE: OnceLock<HashMap<String, CommandSpec>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        crate::commands::keys::register(&mut table);
        crate::commands::strings::register(&mut table);
        crate::commands::lists::register(&mut table);
        crate::commands::hashes::register(&mut table);
        crate::commands::sets::register(&mut table);
        crate::commands::zsets::register(&mut table);
        crate::commands::sys::register(&mut table);
        table
    })
}

pub fn register(table: &mut HashMap<String, CommandSpec>, spec: CommandSpec) {
    table.insert(spec.name.to_string(), spec);
}

/// Case-insensitive lookup.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    command_table().get(&name.to_lowercase())
}

/// All registered command names, for introspection.
pub fn command_names() -> Vec<&'static str> {
    command_table().values().map(|spec| spec.name).collect()
}
