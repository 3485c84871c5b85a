//! Text → token-id encoders.
//!
//! The networks only need a stable `encode(text) -> ids` mapping and the
//! vocabulary size. Id `0` is reserved for padding in every encoder.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};

pub const PAD_ID: u32 = 0;

pub trait Encoder {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn vocab_size(&self) -> usize;
}

/// Word-level encoder hashing lower-cased words into a fixed number of buckets
/// with FNV-1a, so ids are stable across runs and platforms.
#[derive(Debug, Clone)]
pub struct HashingEncoder {
    buckets: u32,
}

impl HashingEncoder {
    pub fn new(vocab_size: usize) -> Result<Self> {
        if vocab_size < 2 {
            bail!("hashing encoder needs at least 2 ids, got {vocab_size}");
        }
        Ok(Self {
            buckets: (vocab_size - 1) as u32,
        })
    }

    fn fnv1a(word: &str) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in word.bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }
}

impl Encoder for HashingEncoder {
    fn encode(&self, text: &str) -> Vec<u32> {
        split_words(text)
            .map(|w| 1 + Self::fnv1a(&w.to_lowercase()) % self.buckets)
            .collect()
    }

    fn vocab_size(&self) -> usize {
        self.buckets as usize + 1
    }
}

/// Encoder backed by a vocabulary file with one token per line.
/// Line `n` (0-based) maps to id `n + 2`; `1` is the unknown-word id.
#[derive(Debug, Clone)]
pub struct VocabEncoder {
    ids: HashMap<String, u32>,
}

impl VocabEncoder {
    pub const UNK_ID: u32 = 1;

    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ids = HashMap::new();
        for word in words {
            let word = word.as_ref().trim().to_lowercase();
            if word.is_empty() || ids.contains_key(&word) {
                continue;
            }
            let id = ids.len() as u32 + 2;
            ids.insert(word, id);
        }
        Self { ids }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocabulary from {}", path.display()))?;
        Ok(Self::from_words(text.lines()))
    }
}

impl Encoder for VocabEncoder {
    fn encode(&self, text: &str) -> Vec<u32> {
        split_words(text)
            .map(|w| {
                self.ids
                    .get(&w.to_lowercase())
                    .copied()
                    .unwrap_or(Self::UNK_ID)
            })
            .collect()
    }

    fn vocab_size(&self) -> usize {
        self.ids.len() + 2
    }
}

fn split_words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| c.is_whitespace() || c == ',' || c == ':')
        .filter(|w| !w.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashing_encoder_is_stable_and_in_range() {
        let enc = HashingEncoder::new(512).unwrap();
        let a = enc.encode("Go forward, then turn left");
        let b = enc.encode("go FORWARD then turn left");
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        assert!(a.iter().all(|&id| id >= 1 && (id as usize) < enc.vocab_size()));
    }

    #[test]
    fn test_hashing_encoder_rejects_tiny_vocab() {
        assert!(HashingEncoder::new(1).is_err());
    }

    #[test]
    fn test_vocab_encoder_unknown_words() {
        let enc = VocabEncoder::from_words(["go", "forward", "turn", "go"]);
        assert_eq!(enc.vocab_size(), 5);
        assert_eq!(enc.encode("go forward"), vec![2, 3]);
        assert_eq!(enc.encode("go sideways"), vec![2, VocabEncoder::UNK_ID]);
    }

    #[test]
    fn test_vocab_encoder_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");
        std::fs::write(&path, "goal\nagent\n\nball\n").unwrap();
        let enc = VocabEncoder::from_file(&path).unwrap();
        assert_eq!(enc.encode("ball"), vec![4]);
        assert!(VocabEncoder::from_file(dir.path().join("missing.txt")).is_err());
    }
}
