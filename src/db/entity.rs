//! The typed value container stored under every key.

use std::collections::HashMap;

use crate::datastruct::bitmap::Bitmap;
use crate::datastruct::quicklist::QuickList;
use crate::datastruct::set::Set;
use crate::datastruct::sortedset::SortedSet;

/// A value in the key space. The variant is fixed when the key is created;
/// commands that expect a different variant answer WRONGTYPE and leave the
/// entity untouched. `Bitmap` is the bit-command representation of the
/// string variant and reports itself as "string".
#[derive(Debug, Clone)]
pub enum DataEntity {
    Str(String),
    Bitmap(Bitmap),
    List(QuickList<String>),
    Set(Set),
    Hash(HashMap<String, String>),
    SortedSet(SortedSet),
}

impl DataEntity {
    /// The name reported by the TYPE command.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataEntity::Str(_) | DataEntity::Bitmap(_) => "string",
            DataEntity::List(_) => "list",
            DataEntity::Set(_) => "set",
            DataEntity::Hash(_) => "hash",
            DataEntity::SortedSet(_) => "zset",
        }
    }
}
