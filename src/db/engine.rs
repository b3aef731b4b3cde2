//! The multi-database engine behind every connection.
//!
//! `exec` is the single entry point for commands. Connection-state commands
//! (AUTH, SELECT, the MULTI family) are handled here; everything else is
//! dispatched through the command table: prepare the write/read key sets,
//! take the shard locks, run the handler, bump versions and feed the
//! append-only log while the locks are still held so the log preserves the
//! observable commit order.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::aof::marshal::{entity_to_cmds, make_expire_cmd};
use crate::aof::Persister;
use crate::config::ServerConfig;
use crate::connection::Session;
use crate::db::command::{lookup, CommandSpec, ExecCtx};
use crate::db::database::{Database, KeyEventCallback};
use crate::db::entity::DataEntity;
use crate::resp::{make_cmd_line, CmdLine, RespValue};

pub struct DbEngine {
    pub config: Arc<ServerConfig>,
    dbs: Vec<Arc<Database>>,
    persister: RwLock<Option<Arc<Persister>>>,
}

impl DbEngine {
    pub fn new(config: Arc<ServerConfig>) -> Arc<DbEngine> {
        let dbs = (0..config.databases).map(|i| Arc::new(Database::new(i))).collect();
        Arc::new(DbEngine {
            config,
            dbs,
            persister: RwLock::new(None),
        })
    }

    pub fn set_persister(&self, persister: Arc<Persister>) {
        *self.persister.write() = Some(persister);
    }

    pub fn persister(&self) -> Option<Arc<Persister>> {
        self.persister.read().clone()
    }

    pub fn db_count(&self) -> usize {
        self.dbs.len()
    }

    pub fn db(&self, index: usize) -> Option<&Arc<Database>> {
        self.dbs.get(index)
    }

    /// Installs the key-created hook on every database.
    pub fn set_key_inserted_callback(&self, cb: Option<KeyEventCallback>) {
        for db in &self.dbs {
            db.set_insert_callback(cb.clone());
        }
    }

    /// Installs the key-deleted hook on every database.
    pub fn set_key_deleted_callback(&self, cb: Option<KeyEventCallback>) {
        for db in &self.dbs {
            db.set_delete_callback(cb.clone());
        }
    }

    /// Executes one command for a session.
    pub fn exec(&self, session: &mut Session, cmdline: &CmdLine) -> RespValue {
        let name = cmdline[0].to_lowercase();
        let args = &cmdline[1..];

        if name == "auth" {
            return self.auth(session, args);
        }
        if !self.config.require_pass.is_empty() && !session.authenticated && !session.fake {
            return RespValue::Error("NOAUTH Authentication required".to_string());
        }

        match name.as_str() {
            "select" => return self.select(session, args),
            "multi" => return self.multi(session, args),
            "discard" => return self.discard(session, args),
            "exec" => return self.exec_queued(session, args),
            "watch" => return self.watch(session, args),
            "unwatch" => return self.unwatch(session, args),
            "info" => return self.info(),
            "bgrewriteaof" => return self.bg_rewrite_aof(),
            _ => {}
        }

        if let Some(multi) = session.multi.as_mut() {
            // Queue-time validation; a bad command poisons the transaction.
            match lookup(&name) {
                Some(spec) if spec.arity_matches(cmdline.len()) => {
                    multi.queue.push(cmdline.clone());
                    return RespValue::SimpleString("QUEUED".to_string());
                }
                Some(_) => {
                    multi.has_error = true;
                    return RespValue::Error(format!(
                        "ERR wrong number of arguments for '{}' command",
                        name
                    ));
                }
                None => {
                    multi.has_error = true;
                    return RespValue::Error(format!("ERR unknown command '{}'", cmdline[0]));
                }
            }
        }

        self.exec_normal(session.db_index, cmdline)
    }

    /// Dispatches a single non-transactional command against one database.
    pub fn exec_normal(&self, db_index: usize, cmdline: &CmdLine) -> RespValue {
        let name = cmdline[0].to_lowercase();
        let Some(spec) = lookup(&name) else {
            return RespValue::Error(format!("ERR unknown command '{}'", cmdline[0]));
        };
        if !spec.arity_matches(cmdline.len()) {
            return RespValue::Error(format!(
                "ERR wrong number of arguments for '{}' command",
                name
            ));
        }
        let Some(db) = self.dbs.get(db_index) else {
            return RespValue::Error("ERR DB index is out of range".to_string());
        };
        let args = &cmdline[1..];
        let (write_keys, read_keys) = (spec.prepare)(args);
        let guard = db.locker().rw_locks(&write_keys, &read_keys);
        let mut ctx = ExecCtx::new();
        let reply = (spec.handler)(db, &mut ctx, args);
        if spec.write && !reply.is_error() {
            db.add_version(&write_keys);
            self.flush_aof(db_index, ctx.take_aof());
        }
        drop(guard);
        reply
    }

    fn auth(&self, session: &mut Session, args: &[String]) -> RespValue {
        if args.len() != 1 {
            return RespValue::Error("ERR wrong number of arguments for 'auth' command".to_string());
        }
        if self.config.require_pass.is_empty() {
            return RespValue::Error(
                "ERR Client sent AUTH, but no password is set".to_string(),
            );
        }
        if args[0] == self.config.require_pass {
            session.authenticated = true;
            RespValue::ok()
        } else {
            RespValue::Error("ERR invalid password".to_string())
        }
    }

    fn select(&self, session: &mut Session, args: &[String]) -> RespValue {
        if args.len() != 1 {
            return RespValue::Error(
                "ERR wrong number of arguments for 'select' command".to_string(),
            );
        }
        let Ok(index) = args[0].parse::<usize>() else {
            return RespValue::Error("ERR invalid DB index".to_string());
        };
        if index >= self.dbs.len() {
            return RespValue::Error("ERR DB index is out of range".to_string());
        }
        session.db_index = index;
        RespValue::ok()
    }

    fn multi(&self, session: &mut Session, args: &[String]) -> RespValue {
        if !args.is_empty() {
            return RespValue::Error("ERR wrong number of arguments for 'multi' command".to_string());
        }
        if session.in_multi() {
            return RespValue::Error("ERR MULTI calls can not be nested".to_string());
        }
        session.multi = Some(Default::default());
        RespValue::ok()
    }

    fn discard(&self, session: &mut Session, args: &[String]) -> RespValue {
        if !args.is_empty() {
            return RespValue::Error(
                "ERR wrong number of arguments for 'discard' command".to_string(),
            );
        }
        if session.multi.take().is_none() {
            return RespValue::Error("ERR DISCARD without MULTI".to_string());
        }
        session.watching.clear();
        RespValue::ok()
    }

    fn watch(&self, session: &mut Session, args: &[String]) -> RespValue {
        if args.is_empty() {
            return RespValue::Error("ERR wrong number of arguments for 'watch' command".to_string());
        }
        if session.in_multi() {
            return RespValue::Error("ERR WATCH inside MULTI is not allowed".to_string());
        }
        let Some(db) = self.dbs.get(session.db_index) else {
            return RespValue::Error("ERR DB index is out of range".to_string());
        };
        for key in args {
            session.watching.insert(key.clone(), db.get_version(key));
        }
        RespValue::ok()
    }

    fn unwatch(&self, session: &mut Session, args: &[String]) -> RespValue {
        if !args.is_empty() {
            return RespValue::Error(
                "ERR wrong number of arguments for 'unwatch' command".to_string(),
            );
        }
        session.watching.clear();
        RespValue::ok()
    }

    fn exec_queued(&self, session: &mut Session, args: &[String]) -> RespValue {
        if !args.is_empty() {
            return RespValue::Error("ERR wrong number of arguments for 'exec' command".to_string());
        }
        let Some(multi) = session.multi.take() else {
            return RespValue::Error("ERR EXEC without MULTI".to_string());
        };
        let watching = std::mem::take(&mut session.watching);
        if multi.has_error {
            return RespValue::Error(
                "EXECABORT Transaction discarded because of previous errors.".to_string(),
            );
        }
        if multi.queue.is_empty() {
            return RespValue::Array(Vec::new());
        }
        self.exec_multi(session.db_index, &watching, multi.queue)
    }

    /// Executes a queued batch atomically: all shard locks are taken up
    /// front, watched versions are verified, and a failing command rolls the
    /// batch back through compensating undo commands.
    pub fn exec_multi(
        &self,
        db_index: usize,
        watching: &std::collections::HashMap<String, u64>,
        cmdlines: Vec<CmdLine>,
    ) -> RespValue {
        let Some(db) = self.dbs.get(db_index) else {
            return RespValue::Error("ERR DB index is out of range".to_string());
        };
        let mut write_keys: Vec<String> = Vec::new();
        let mut read_keys: Vec<String> = Vec::new();
        let mut specs: Vec<&'static CommandSpec> = Vec::with_capacity(cmdlines.len());
        for cmdline in &cmdlines {
            let Some(spec) = lookup(&cmdline[0].to_lowercase()) else {
                return RespValue::Error(format!("ERR unknown command '{}'", cmdline[0]));
            };
            if !spec.arity_matches(cmdline.len()) {
                return RespValue::Error(format!(
                    "ERR wrong number of arguments for '{}' command",
                    spec.name
                ));
            }
            let (mut w, mut r) = (spec.prepare)(&cmdline[1..]);
            write_keys.append(&mut w);
            read_keys.append(&mut r);
            specs.push(spec);
        }
        read_keys.extend(watching.keys().cloned());

        let guard = db.locker().rw_locks(&write_keys, &read_keys);
        for (key, version) in watching {
            if db.get_version(key) != *version {
                return RespValue::NullArray;
            }
        }

        let mut results = Vec::with_capacity(cmdlines.len());
        let mut undo_logs: Vec<Vec<CmdLine>> = Vec::new();
        let mut aof_buf: Vec<CmdLine> = Vec::new();
        let mut failure: Option<RespValue> = None;
        for (cmdline, spec) in cmdlines.iter().zip(&specs) {
            let args = &cmdline[1..];
            let undo = if spec.write {
                self.undo_for(db, spec, args)
            } else {
                Vec::new()
            };
            let mut ctx = ExecCtx::new();
            let reply = (spec.handler)(db, &mut ctx, args);
            if reply.is_error() {
                failure = Some(reply);
                break;
            }
            undo_logs.push(undo);
            aof_buf.extend(ctx.take_aof());
            results.push(reply);
        }

        if let Some(error) = failure {
            // Roll executed commands back, newest first.
            for undo in undo_logs.iter().rev() {
                for cmd in undo {
                    self.apply_quiet(db, cmd);
                }
            }
            return error;
        }

        db.add_version(&write_keys);
        self.flush_aof(db_index, aof_buf);
        drop(guard);
        RespValue::Array(results)
    }

    /// Compensating commands that restore the current state of every key the
    /// command would write.
    pub fn get_undo_logs(&self, db_index: usize, cmdline: &CmdLine) -> Vec<CmdLine> {
        let Some(db) = self.dbs.get(db_index) else {
            return Vec::new();
        };
        let Some(spec) = lookup(&cmdline[0].to_lowercase()) else {
            return Vec::new();
        };
        self.undo_for(db, spec, &cmdline[1..])
    }

    fn undo_for(&self, db: &Database, spec: &CommandSpec, args: &[String]) -> Vec<CmdLine> {
        let (write_keys, _) = (spec.prepare)(args);
        let mut cmds = Vec::new();
        for key in write_keys {
            cmds.push(make_cmd_line("DEL", &[&key]));
            if let Some(entity) = db.get_entity_clone(&key) {
                cmds.extend(entity_to_cmds(&key, &entity));
                if let Some(at_ms) = db.ttl_at(&key) {
                    cmds.push(make_expire_cmd(&key, at_ms));
                }
            }
        }
        cmds
    }

    /// Applies a compensating command without locking or logging; the caller
    /// already holds the shard locks.
    fn apply_quiet(&self, db: &Database, cmdline: &CmdLine) {
        let Some(spec) = lookup(&cmdline[0].to_lowercase()) else {
            warn!(cmd = %cmdline[0], "undo references unknown command");
            return;
        };
        let mut ctx = ExecCtx::new();
        let reply = (spec.handler)(db, &mut ctx, &cmdline[1..]);
        if reply.is_error() {
            warn!(cmd = %cmdline[0], "undo command failed");
        }
    }

    fn flush_aof(&self, db_index: usize, cmds: Vec<CmdLine>) {
        if cmds.is_empty() {
            return;
        }
        if let Some(persister) = self.persister.read().as_ref() {
            for cmd in cmds {
                persister.save_cmd_line(db_index, cmd);
            }
        }
    }

    /// Walks one database, skipping expired entries.
    pub fn for_each(
        &self,
        db_index: usize,
        cb: impl FnMut(&str, &DataEntity, Option<i64>) -> bool,
    ) {
        if let Some(db) = self.dbs.get(db_index) {
            db.for_each(cb);
        }
    }

    fn info(&self) -> RespValue {
        let mut out = String::new();
        out.push_str("# Server\r\n");
        out.push_str(&format!("run_id:{}\r\n", self.config.run_id));
        out.push_str(&format!("tcp_port:{}\r\n", self.config.port));
        out.push_str("# Keyspace\r\n");
        for (index, db) in self.dbs.iter().enumerate() {
            if !db.is_empty() {
                out.push_str(&format!(
                    "db{}:keys={},expires={}\r\n",
                    index,
                    db.len(),
                    db.ttl_count()
                ));
            }
        }
        RespValue::BulkString(out)
    }

    fn bg_rewrite_aof(&self) -> RespValue {
        let Some(persister) = self.persister.read().clone() else {
            return RespValue::Error("ERR append only file is not enabled".to_string());
        };
        std::thread::spawn(move || {
            if let Err(err) = persister.rewrite() {
                warn!(%err, "background rewrite failed");
            }
        });
        RespValue::SimpleString("Background append only file rewriting started".to_string())
    }

    pub fn close(&self) {
        if let Some(persister) = self.persister.read().as_ref() {
            persister.close();
        }
    }
}
