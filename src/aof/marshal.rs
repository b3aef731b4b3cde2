//! Serialization of entities into their canonical minimum-form commands.
//!
//! The rewrite pipeline and the transaction undo logs both reduce a live
//! entity to the shortest command sequence that recreates it: one SET /
//! RPUSH / SADD / HMSET / ZADD per key, a SETBIT series for bit-typed
//! strings, plus a PEXPIREAT when a TTL is set.

use crate::db::entity::DataEntity;
use crate::resp::{make_cmd_line, CmdLine};

/// Commands that recreate `key` with the entity's current value.
pub fn entity_to_cmds(key: &str, entity: &DataEntity) -> Vec<CmdLine> {
    match entity {
        DataEntity::Str(value) => vec![make_cmd_line("SET", &[key, value])],
        DataEntity::Bitmap(bitmap) => {
            let mut cmds = Vec::new();
            bitmap.for_each_bit(0, 0, |offset, bit| {
                if bit == 1 {
                    cmds.push(make_cmd_line("SETBIT", &[key, &offset.to_string(), "1"]));
                }
                true
            });
            if cmds.is_empty() {
                // All-zero bitmap: materialize the key at its current width.
                let bits = bitmap.bit_size();
                if bits == 0 {
                    cmds.push(make_cmd_line("SET", &[key, ""]));
                } else {
                    cmds.push(make_cmd_line(
                        "SETBIT",
                        &[key, &(bits - 1).to_string(), "0"],
                    ));
                }
            }
            cmds
        }
        DataEntity::List(list) => {
            let mut line = make_cmd_line("RPUSH", &[key]);
            list.for_each(|_, value| {
                line.push(value.clone());
                true
            });
            vec![line]
        }
        DataEntity::Set(set) => {
            let mut line = make_cmd_line("SADD", &[key]);
            set.for_each(|member| {
                line.push(member.to_string());
                true
            });
            vec![line]
        }
        DataEntity::Hash(hash) => {
            let mut line = make_cmd_line("HMSET", &[key]);
            for (field, value) in hash {
                line.push(field.clone());
                line.push(value.clone());
            }
            vec![line]
        }
        DataEntity::SortedSet(zset) => {
            let mut line = make_cmd_line("ZADD", &[key]);
            if !zset.is_empty() {
                zset.for_each_by_rank(0, zset.len(), false, |element| {
                    line.push(element.score.to_string());
                    line.push(element.member.clone());
                    true
                });
            }
            vec![line]
        }
    }
}

/// `PEXPIREAT key <ms-since-epoch>`.
pub fn make_expire_cmd(key: &str, at_ms: i64) -> CmdLine {
    make_cmd_line("PEXPIREAT", &[key, &at_ms.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastruct::bitmap::Bitmap;
    use crate::datastruct::quicklist::QuickList;
    use crate::datastruct::sortedset::SortedSet;

    #[test]
    fn test_string_to_cmd() {
        let cmds = entity_to_cmds("k", &DataEntity::Str("v".to_string()));
        assert_eq!(cmds, vec![vec!["SET".to_string(), "k".to_string(), "v".to_string()]]);
    }

    #[test]
    fn test_list_to_cmd_preserves_order() {
        let mut list = QuickList::new();
        list.add("a".to_string());
        list.add("b".to_string());
        let cmds = entity_to_cmds("l", &DataEntity::List(list));
        assert_eq!(
            cmds,
            vec![vec![
                "RPUSH".to_string(),
                "l".to_string(),
                "a".to_string(),
                "b".to_string()
            ]]
        );
    }

    #[test]
    fn test_zset_to_cmd_is_score_member_pairs() {
        let mut zset = SortedSet::new();
        zset.add("b", 2.0);
        zset.add("a", 1.0);
        let cmds = entity_to_cmds("z", &DataEntity::SortedSet(zset));
        assert_eq!(
            cmds,
            vec![vec![
                "ZADD".to_string(),
                "z".to_string(),
                "1".to_string(),
                "a".to_string(),
                "2".to_string(),
                "b".to_string()
            ]]
        );
    }

    #[test]
    fn test_bitmap_to_setbit_series() {
        let mut bitmap = Bitmap::new();
        bitmap.set_bit(3, 1);
        bitmap.set_bit(11, 1);
        let cmds = entity_to_cmds("b", &DataEntity::Bitmap(bitmap));
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0], vec!["SETBIT", "b", "3", "1"]);
        assert_eq!(cmds[1], vec!["SETBIT", "b", "11", "1"]);
    }

    #[test]
    fn test_expire_cmd() {
        assert_eq!(
            make_expire_cmd("k", 123456),
            vec!["PEXPIREAT".to_string(), "k".to_string(), "123456".to_string()]
        );
    }
}
