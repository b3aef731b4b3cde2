//! RDB snapshot encoding and decoding for the rewrite preamble.
//!
//! When `aof-use-rdb-preamble` is on, a rewritten append-only file starts
//! with an RDB payload and continues with plain RESP commands. The encoder
//! here writes exactly the subset the decoder reads: length-encoded sizes
//! (6, 14 and 32 bit forms), raw strings, the AUX / SELECTDB / RESIZEDB /
//! EXPIRETIME_MS / EOF opcodes, and one object layout per entity variant.
//! Integer-packed strings are accepted on decode for compatibility; LZF
//! compression is rejected.

mod decode;
mod encode;

pub use decode::decode_into;
pub use encode::encode_engine;

use thiserror::Error;

pub(crate) const RDB_HEADER: &[u8] = b"REDIS0009";

pub(crate) const OPCODE_AUX: u8 = 0xFA;
pub(crate) const OPCODE_RESIZEDB: u8 = 0xFB;
pub(crate) const OPCODE_EXPIRETIME_MS: u8 = 0xFC;
pub(crate) const OPCODE_SELECTDB: u8 = 0xFE;
pub(crate) const OPCODE_EOF: u8 = 0xFF;

pub(crate) const TYPE_STRING: u8 = 0;
pub(crate) const TYPE_LIST: u8 = 1;
pub(crate) const TYPE_SET: u8 = 2;
pub(crate) const TYPE_ZSET: u8 = 3;
pub(crate) const TYPE_HASH: u8 = 4;

#[derive(Error, Debug, PartialEq)]
pub enum RdbError {
    #[error("not an RDB payload")]
    BadHeader,
    #[error("unexpected end of RDB payload")]
    UnexpectedEof,
    #[error("invalid length encoding")]
    InvalidLength,
    #[error("LZF compressed strings are not supported")]
    LzfUnsupported,
    #[error("unknown object type: {0}")]
    UnknownType(u8),
    #[error("invalid key encoding")]
    InvalidKey,
    #[error("database index {0} out of range")]
    DbIndexOutOfRange(usize),
}
