//! RDB encoder: walks every database and emits the snapshot payload.

use std::io::{self, Write};

use crate::db::engine::DbEngine;
use crate::db::entity::DataEntity;

use super::{
    OPCODE_AUX, OPCODE_EOF, OPCODE_EXPIRETIME_MS, OPCODE_RESIZEDB, OPCODE_SELECTDB, RDB_HEADER,
    TYPE_HASH, TYPE_LIST, TYPE_SET, TYPE_STRING, TYPE_ZSET,
};

fn write_length(out: &mut impl Write, length: usize) -> io::Result<()> {
    if length < 1 << 6 {
        out.write_all(&[length as u8])
    } else if length < 1 << 14 {
        out.write_all(&[0b0100_0000 | (length >> 8) as u8, (length & 0xFF) as u8])
    } else {
        out.write_all(&[0x80])?;
        out.write_all(&(length as u32).to_be_bytes())
    }
}

fn write_string(out: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    write_length(out, bytes.len())?;
    out.write_all(bytes)
}

fn write_aux(out: &mut impl Write, key: &str, value: &str) -> io::Result<()> {
    out.write_all(&[OPCODE_AUX])?;
    write_string(out, key.as_bytes())?;
    write_string(out, value.as_bytes())
}

fn write_entity(out: &mut impl Write, key: &str, entity: &DataEntity) -> io::Result<()> {
    match entity {
        DataEntity::Str(value) => {
            out.write_all(&[TYPE_STRING])?;
            write_string(out, key.as_bytes())?;
            write_string(out, value.as_bytes())
        }
        DataEntity::Bitmap(bitmap) => {
            // Bit-typed strings serialize as their raw bytes.
            out.write_all(&[TYPE_STRING])?;
            write_string(out, key.as_bytes())?;
            write_string(out, bitmap.as_bytes())
        }
        DataEntity::List(list) => {
            out.write_all(&[TYPE_LIST])?;
            write_string(out, key.as_bytes())?;
            write_length(out, list.len())?;
            let mut result = Ok(());
            list.for_each(|_, value| {
                result = write_string(out, value.as_bytes());
                result.is_ok()
            });
            result
        }
        DataEntity::Set(set) => {
            out.write_all(&[TYPE_SET])?;
            write_string(out, key.as_bytes())?;
            write_length(out, set.len())?;
            let mut result = Ok(());
            set.for_each(|member| {
                result = write_string(out, member.as_bytes());
                result.is_ok()
            });
            result
        }
        DataEntity::SortedSet(zset) => {
            out.write_all(&[TYPE_ZSET])?;
            write_string(out, key.as_bytes())?;
            write_length(out, zset.len())?;
            let mut result = Ok(());
            if !zset.is_empty() {
                zset.for_each_by_rank(0, zset.len(), false, |element| {
                    result = write_string(out, element.member.as_bytes()).and_then(|_| {
                        write_string(out, element.score.to_string().as_bytes())
                    });
                    result.is_ok()
                });
            }
            result
        }
        DataEntity::Hash(hash) => {
            out.write_all(&[TYPE_HASH])?;
            write_string(out, key.as_bytes())?;
            write_length(out, hash.len())?;
            for (field, value) in hash {
                write_string(out, field.as_bytes())?;
                write_string(out, value.as_bytes())?;
            }
            Ok(())
        }
    }
}

/// Writes a full snapshot of every non-empty database.
pub fn encode_engine(engine: &DbEngine, out: &mut impl Write) -> io::Result<()> {
    out.write_all(RDB_HEADER)?;
    write_aux(out, "redis-ver", "6.0.0")?;
    write_aux(out, "aof-preamble", "1")?;

    for db_index in 0..engine.db_count() {
        let Some(db) = engine.db(db_index) else { continue };
        if db.is_empty() {
            continue;
        }
        out.write_all(&[OPCODE_SELECTDB])?;
        write_length(out, db_index)?;
        out.write_all(&[OPCODE_RESIZEDB])?;
        write_length(out, db.len())?;
        write_length(out, db.ttl_count())?;

        let mut result = Ok(());
        db.for_each(|key, entity, expire_at| {
            if let Some(at_ms) = expire_at {
                result = out
                    .write_all(&[OPCODE_EXPIRETIME_MS])
                    .and_then(|_| out.write_all(&(at_ms as u64).to_le_bytes()));
                if result.is_err() {
                    return false;
                }
            }
            result = write_entity(out, key, entity);
            result.is_ok()
        });
        result?;
    }

    out.write_all(&[OPCODE_EOF])?;
    // Checksum disabled, as when rdbchecksum is off.
    out.write_all(&[0u8; 8])
}
