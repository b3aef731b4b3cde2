//! Log compaction.
//!
//! Rewrite happens in three phases. Start: under the persister lock, sync
//! the live file, snapshot its size and the selected database, and open a
//! temp file. Do: replay the snapshot prefix into a sandbox engine and dump
//! it in minimum-command form (or as an RDB preamble). Finish: back under
//! the lock, append everything written after the snapshot point verbatim,
//! atomically rename the temp file over the live one and reopen it.
//! Because the size snapshot and the tail copy happen under the same lock
//! that sequences every write, no command is lost or duplicated.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{error, info};

use crate::aof::load::load_aof;
use crate::aof::marshal::{entity_to_cmds, make_expire_cmd};
use crate::aof::{AofError, Persister};
use crate::db::engine::DbEngine;
use crate::resp::{make_cmd_line, RespValue};

pub struct RewriteCtx {
    tmp: NamedTempFile,
    /// Size of the live file when the rewrite began; the tail after this
    /// offset is appended verbatim at finish.
    file_size: u64,
    /// Database selected in the log at the snapshot point.
    db_idx: usize,
}

fn write_cmd(out: &mut impl Write, cmdline: &[String]) -> io::Result<()> {
    out.write_all(RespValue::from_cmd_line(cmdline).encode().as_bytes())
}

impl Persister {
    /// Runs the full rewrite.
    pub fn rewrite(&self) -> Result<(), AofError> {
        let mut ctx = self.start_rewrite()?;
        self.do_rewrite(&mut ctx)?;
        self.finish_rewrite(ctx)
    }

    pub fn start_rewrite(&self) -> Result<RewriteCtx, AofError> {
        let state = self.state.lock();
        state.file.sync_data()?;
        let file_size = std::fs::metadata(&self.aof_path)?.len();

        let tmp_dir = self.config.tmp_dir();
        std::fs::create_dir_all(&tmp_dir)?;
        let tmp = tempfile::Builder::new()
            .suffix(".aof")
            .tempfile_in(&tmp_dir)?;
        Ok(RewriteCtx {
            tmp,
            file_size,
            db_idx: state.current_db,
        })
    }

    /// Dumps the snapshot prefix of the log in compact form into the temp
    /// file, via a sandbox engine that replays it first.
    pub fn do_rewrite(&self, ctx: &mut RewriteCtx) -> Result<(), AofError> {
        let sandbox = DbEngine::new(Arc::clone(&self.config));
        load_aof(&self.aof_path, Some(ctx.file_size as usize), &sandbox);

        let out = ctx.tmp.as_file_mut();
        if self.config.aof_use_rdb_preamble {
            info!("rewriting aof with rdb preamble");
            crate::rdb::encode_engine(&sandbox, out)?;
            return Ok(());
        }

        info!("rewriting aof in command form");
        for db_index in 0..sandbox.db_count() {
            write_cmd(out, &make_cmd_line("SELECT", &[&db_index.to_string()]))?;
            let mut result: io::Result<()> = Ok(());
            sandbox.for_each(db_index, |key, entity, expire_at| {
                for cmdline in entity_to_cmds(key, entity) {
                    result = write_cmd(out, &cmdline);
                    if result.is_err() {
                        return false;
                    }
                }
                if let Some(at_ms) = expire_at {
                    result = write_cmd(out, &make_expire_cmd(key, at_ms));
                }
                result.is_ok()
            });
            result?;
        }
        Ok(())
    }

    /// Appends the live tail, swaps the files and reopens the log.
    pub fn finish_rewrite(&self, mut ctx: RewriteCtx) -> Result<(), AofError> {
        let mut state = self.state.lock();

        let mut copy_tail = || -> io::Result<()> {
            let mut src = File::open(&self.aof_path)?;
            src.seek(SeekFrom::Start(ctx.file_size))?;
            let out = ctx.tmp.as_file_mut();
            // The tail was written relative to the database selected at the
            // snapshot point.
            write_cmd(out, &make_cmd_line("SELECT", &[&ctx.db_idx.to_string()]))?;
            io::copy(&mut src, out)?;
            out.sync_data()
        };
        if let Err(err) = copy_tail() {
            error!(%err, "rewrite tail copy failed");
            return Err(err.into());
        }

        ctx.tmp
            .persist(&self.aof_path)
            .map_err(|err| AofError::Persist(err.to_string()))?;

        // Failing to reopen the log would silently drop every future write.
        let file = match OpenOptions::new().create(true).append(true).open(&self.aof_path) {
            Ok(file) => file,
            Err(err) => panic!("cannot reopen aof after rewrite: {}", err),
        };
        state.file = file;
        let select = make_cmd_line("SELECT", &[&state.current_db.to_string()]);
        if let Err(err) = state
            .file
            .write_all(RespValue::from_cmd_line(&select).encode().as_bytes())
        {
            panic!("cannot restore db selection after rewrite: {}", err);
        }
        info!("aof rewrite finished");
        Ok(())
    }
}
