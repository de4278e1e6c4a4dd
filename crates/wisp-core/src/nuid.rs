//! Unique id generation for inbox suffixes and request tokens
//!
//! Ids are 22 base-62 characters, wide enough that collisions within a
//! client's lifetime are not a practical concern.

use rand::Rng;

/// Length of a generated id
pub const NUID_LEN: usize = 22;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Generate a fresh 22-character base-62 id
pub fn next() -> String {
    let mut rng = rand::thread_rng();
    let mut out = String::with_capacity(NUID_LEN);
    for _ in 0..NUID_LEN {
        let idx = rng.gen_range(0..ALPHABET.len());
        out.push(ALPHABET[idx] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_and_alphabet() {
        let id = next();
        assert_eq!(id.len(), NUID_LEN);
        assert!(id.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn test_uniqueness() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(next()), "duplicate id generated");
        }
    }
}
