//! Key-to-slot routing.
//!
//! Keys hash into a fixed number of slots with CRC32-IEEE. A `{...}` hash
//! tag restricts hashing to the tagged substring so related keys can be
//! forced onto one slot, which is what makes multi-key commands possible in
//! cluster mode.

pub const SLOT_COUNT: u32 = 1024;

/// The substring between the first `{` and the following `}` when both are
/// present with non-empty content; otherwise the whole key.
pub fn partition_key(key: &str) -> &str {
    let Some(begin) = key.find('{') else {
        return key;
    };
    match key[begin + 1..].find('}') {
        Some(0) | None => key,
        Some(length) => &key[begin + 1..begin + 1 + length],
    }
}

pub fn slot_of(key: &str) -> u32 {
    crc32fast::hash(partition_key(key).as_bytes()) % SLOT_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_key() {
        let test_cases = [
            ("plain", "plain"),
            ("{user1}.follows", "user1"),
            ("prefix{tag}suffix", "tag"),
            ("{}empty", "{}empty"),
            ("{unclosed", "{unclosed"),
            ("a{b}c{d}e", "b"),
        ];
        for (key, expected) in test_cases {
            assert_eq!(partition_key(key), expected, "partition key of {}", key);
        }
    }

    #[test]
    fn test_hashtag_keys_share_slot() {
        for key in ["user1", "abc", "somewhat-longer-key"] {
            let tagged = format!("prefix-{{{}}}-suffix", key);
            assert_eq!(slot_of(key), slot_of(&tagged), "slot of {}", key);
        }
    }

    #[test]
    fn test_slots_in_range() {
        for i in 0..10_000 {
            assert!(slot_of(&format!("key:{}", i)) < SLOT_COUNT);
        }
    }
}
