//! Startup replay of the append-only file.

use std::path::Path;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tracing::{debug, error, info};

use crate::connection::Session;
use crate::db::engine::DbEngine;
use crate::resp::RespValue;

/// Replays the first `max_bytes` (or all) of the file into `engine`.
///
/// The file may open with an RDB preamble; when one decodes cleanly the
/// remainder is parsed as RESP commands and fed through a fake session so
/// `SELECT` switches databases exactly as it did when the log was written.
/// Individually malformed entries are logged and skipped.
pub fn load_aof(path: &Path, max_bytes: Option<usize>, engine: &Arc<DbEngine>) {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(err) => {
            error!(%err, path = %path.display(), "cannot read aof file");
            return;
        }
    };
    let limit = max_bytes.map_or(bytes.len(), |m| m.min(bytes.len()));
    let slice = &bytes[..limit];

    let mut offset = 0;
    if slice.starts_with(b"REDIS") {
        match crate::rdb::decode_into(slice, engine) {
            Ok(consumed) => {
                info!(bytes = consumed, "loaded rdb preamble");
                offset = consumed;
            }
            Err(err) => {
                // Not a preamble after all; parse from the start.
                debug!(%err, "no usable rdb preamble");
            }
        }
    }

    let mut buf = BytesMut::from(&slice[offset..]);
    let mut session = Session::fake();
    let mut replayed = 0usize;
    while !buf.is_empty() {
        match RespValue::decode(&mut buf) {
            Ok(Some(value)) => match value.as_cmd_line() {
                Some(cmdline) => {
                    let reply = engine.exec(&mut session, &cmdline);
                    if reply.is_error() {
                        error!(cmd = %cmdline[0], reply = ?reply, "replay command failed");
                    } else {
                        replayed += 1;
                    }
                }
                None => error!("replay entry is not a multi bulk command"),
            },
            Ok(None) => break,
            Err(err) => {
                // Skip one byte and retry so a corrupt entry does not end
                // the whole load.
                error!(%err, "replay parse error");
                buf.advance(1);
            }
        }
    }
    info!(commands = replayed, "aof load finished");
}
