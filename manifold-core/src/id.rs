//! Short unique IDs over a configurable alphabet.
//!
//! Sampling is rejection-based: random bytes are masked to the next power
//! of two at or above the alphabet size, and values beyond the alphabet are
//! discarded. This keeps every character equally likely regardless of the
//! alphabet length (no modulo bias).

use rand::RngCore;

use crate::error::{ErrorCode, RpcError};

/// 64-character URL-safe alphabet used by default.
pub const URL_ALPHABET: &str =
    "useandom-26T198340PX75pxJACKVERYMINDBUSHWOLF_GQZbfghjklqvwyzrict";

/// Default id length: 21 characters over a 64-char alphabet is 126 bits.
pub const DEFAULT_ID_LENGTH: usize = 21;

/// Generator producing uniform IDs over a fixed alphabet.
#[derive(Clone, Debug)]
pub struct IdGenerator {
    alphabet: Vec<char>,
    length: usize,
    mask: u8,
}

impl IdGenerator {
    pub fn new(alphabet: &str, length: usize) -> Result<Self, RpcError> {
        let chars: Vec<char> = alphabet.chars().collect();
        if chars.is_empty() || chars.len() > 256 {
            return Err(RpcError::new(
                ErrorCode::InvalidArgument,
                "alphabet must contain between 1 and 256 characters",
            ));
        }
        if length == 0 {
            return Err(RpcError::new(ErrorCode::InvalidArgument, "id length must be at least 1"));
        }
        // Smallest all-ones mask covering the alphabet size.
        let mask = (chars.len().next_power_of_two() - 1).min(255) as u8;
        Ok(Self {
            alphabet: chars,
            length,
            mask,
        })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Generate one ID.
    pub fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        let mut out = String::with_capacity(self.length);
        // Draw a block of bytes at a time; rejected bytes are simply skipped.
        let mut buf = [0u8; 32];
        while out.len() < self.length {
            rng.fill_bytes(&mut buf);
            for byte in buf {
                let index = (byte & self.mask) as usize;
                if let Some(&ch) = self.alphabet.get(index) {
                    out.push(ch);
                    if out.len() == self.length {
                        break;
                    }
                }
            }
        }
        out
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(URL_ALPHABET, DEFAULT_ID_LENGTH).expect("default alphabet is valid")
    }
}

/// Generate an ID with the default alphabet and length.
pub fn generate_id() -> String {
    IdGenerator::default().generate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_use_only_the_alphabet() {
        let generator = IdGenerator::default();
        for _ in 0..100 {
            let id = generator.generate();
            assert_eq!(id.len(), DEFAULT_ID_LENGTH);
            assert!(id.chars().all(|c| URL_ALPHABET.contains(c)), "unexpected char in {id}");
        }
    }

    #[test]
    fn custom_alphabets_and_lengths() {
        for (alphabet, length) in [("ab", 1), ("0123456789", 8), ("xyz", 40)] {
            let generator = IdGenerator::new(alphabet, length).unwrap();
            let id = generator.generate();
            assert_eq!(id.len(), length);
            assert!(id.chars().all(|c| alphabet.contains(c)));
        }
    }

    #[test]
    fn non_power_of_two_alphabet_covers_all_characters() {
        // 10 characters: mask is 15, so indexes 10..=15 are rejected. Every
        // character must still be reachable.
        let generator = IdGenerator::new("0123456789", 32).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.extend(generator.generate().chars());
        }
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn ids_are_unique_in_practice() {
        let generator = IdGenerator::default();
        let ids: HashSet<String> = (0..1000).map(|_| generator.generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        assert!(IdGenerator::new("", 21).is_err());
        assert!(IdGenerator::new("abc", 0).is_err());
    }
}
