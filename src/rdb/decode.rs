//! RDB decoder: applies a snapshot payload to an engine.

use std::collections::HashMap;

use crate::datastruct::bitmap::Bitmap;
use crate::datastruct::quicklist::QuickList;
use crate::datastruct::set::Set;
use crate::datastruct::sortedset::SortedSet;
use crate::db::engine::DbEngine;
use crate::db::entity::DataEntity;

use super::{
    RdbError, OPCODE_AUX, OPCODE_EOF, OPCODE_EXPIRETIME_MS, OPCODE_RESIZEDB, OPCODE_SELECTDB,
    RDB_HEADER, TYPE_HASH, TYPE_LIST, TYPE_SET, TYPE_STRING, TYPE_ZSET,
};

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

enum Length {
    Plain(usize),
    /// 0b11-prefixed special form; the payload is an int-packed string.
    IntEncoded(u8),
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], RdbError> {
        if self.pos + n > self.bytes.len() {
            return Err(RdbError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, RdbError> {
        Ok(self.take(1)?[0])
    }

    fn length(&mut self) -> Result<Length, RdbError> {
        let first = self.byte()?;
        match first >> 6 {
            0b00 => Ok(Length::Plain((first & 0x3F) as usize)),
            0b01 => {
                let second = self.byte()?;
                Ok(Length::Plain((((first & 0x3F) as usize) << 8) | second as usize))
            }
            0b10 => match first {
                0x80 => {
                    let raw: [u8; 4] = self.take(4)?.try_into().map_err(|_| RdbError::UnexpectedEof)?;
                    Ok(Length::Plain(u32::from_be_bytes(raw) as usize))
                }
                0x81 => {
                    let raw: [u8; 8] = self.take(8)?.try_into().map_err(|_| RdbError::UnexpectedEof)?;
                    Ok(Length::Plain(u64::from_be_bytes(raw) as usize))
                }
                _ => Err(RdbError::InvalidLength),
            },
            _ => Ok(Length::IntEncoded(first & 0x3F)),
        }
    }

    fn plain_length(&mut self) -> Result<usize, RdbError> {
        match self.length()? {
            Length::Plain(length) => Ok(length),
            Length::IntEncoded(_) => Err(RdbError::InvalidLength),
        }
    }

    /// A string payload: raw bytes, or an int-packed value rendered in
    /// decimal. LZF frames are rejected.
    fn string(&mut self) -> Result<Vec<u8>, RdbError> {
        match self.length()? {
            Length::Plain(length) => Ok(self.take(length)?.to_vec()),
            Length::IntEncoded(kind) => match kind {
                0 => {
                    let raw = self.take(1)?;
                    Ok((raw[0] as i8).to_string().into_bytes())
                }
                1 => {
                    let raw: [u8; 2] = self.take(2)?.try_into().map_err(|_| RdbError::UnexpectedEof)?;
                    Ok(i16::from_le_bytes(raw).to_string().into_bytes())
                }
                2 => {
                    let raw: [u8; 4] = self.take(4)?.try_into().map_err(|_| RdbError::UnexpectedEof)?;
                    Ok(i32::from_le_bytes(raw).to_string().into_bytes())
                }
                3 => Err(RdbError::LzfUnsupported),
                _ => Err(RdbError::InvalidLength),
            },
        }
    }

    fn utf8_string(&mut self) -> Result<String, RdbError> {
        String::from_utf8(self.string()?).map_err(|_| RdbError::InvalidKey)
    }
}

fn read_entity(reader: &mut Reader<'_>, type_byte: u8) -> Result<(String, DataEntity), RdbError> {
    let key = reader.utf8_string()?;
    let entity = match type_byte {
        TYPE_STRING => match String::from_utf8(reader.string()?) {
            Ok(value) => DataEntity::Str(value),
            // Raw byte payloads come back as bitmaps.
            Err(err) => DataEntity::Bitmap(Bitmap::from_bytes(err.into_bytes())),
        },
        TYPE_LIST => {
            let count = reader.plain_length()?;
            let mut list = QuickList::new();
            for _ in 0..count {
                list.add(reader.utf8_string()?);
            }
            DataEntity::List(list)
        }
        TYPE_SET => {
            let count = reader.plain_length()?;
            let mut set = Set::new();
            for _ in 0..count {
                set.add(&reader.utf8_string()?);
            }
            DataEntity::Set(set)
        }
        TYPE_ZSET => {
            let count = reader.plain_length()?;
            let mut zset = SortedSet::new();
            for _ in 0..count {
                let member = reader.utf8_string()?;
                let score: f64 = reader
                    .utf8_string()?
                    .parse()
                    .map_err(|_| RdbError::InvalidLength)?;
                zset.add(&member, score);
            }
            DataEntity::SortedSet(zset)
        }
        TYPE_HASH => {
            let count = reader.plain_length()?;
            let mut hash = HashMap::new();
            for _ in 0..count {
                let field = reader.utf8_string()?;
                let value = reader.utf8_string()?;
                hash.insert(field, value);
            }
            DataEntity::Hash(hash)
        }
        other => return Err(RdbError::UnknownType(other)),
    };
    Ok((key, entity))
}

/// Applies the RDB payload at the head of `bytes` to `engine` and returns
/// how many bytes it occupied.
pub fn decode_into(bytes: &[u8], engine: &DbEngine) -> Result<usize, RdbError> {
    if bytes.len() < RDB_HEADER.len() || &bytes[..5] != b"REDIS" {
        return Err(RdbError::BadHeader);
    }
    let mut reader = Reader {
        bytes,
        pos: RDB_HEADER.len(),
    };
    let mut db_index = 0usize;
    let mut pending_expire: Option<i64> = None;
    loop {
        let opcode = reader.byte()?;
        match opcode {
            OPCODE_AUX => {
                let _key = reader.string()?;
                let _value = reader.string()?;
            }
            OPCODE_SELECTDB => {
                db_index = reader.plain_length()?;
                if engine.db(db_index).is_none() {
                    return Err(RdbError::DbIndexOutOfRange(db_index));
                }
            }
            OPCODE_RESIZEDB => {
                let _keys = reader.plain_length()?;
                let _ttls = reader.plain_length()?;
            }
            OPCODE_EXPIRETIME_MS => {
                let raw: [u8; 8] = reader
                    .take(8)?
                    .try_into()
                    .map_err(|_| RdbError::UnexpectedEof)?;
                pending_expire = Some(u64::from_le_bytes(raw) as i64);
            }
            OPCODE_EOF => {
                // Trailing checksum (zeroed when disabled).
                reader.take(8)?;
                return Ok(reader.pos);
            }
            type_byte => {
                let (key, entity) = read_entity(&mut reader, type_byte)?;
                let db = engine
                    .db(db_index)
                    .ok_or(RdbError::DbIndexOutOfRange(db_index))?;
                db.put_entity(&key, entity);
                if let Some(at_ms) = pending_expire.take() {
                    db.expire_at(&key, at_ms);
                }
            }
        }
    }
}
