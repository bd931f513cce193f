//! A small o200k_harmony encoding shared by the integration tests.
#![allow(dead_code)]
use base64::{engine::general_purpose, Engine as _};
use harmony::{HarmonyEncoding, VocabularyTable};
use std::sync::OnceLock;

/// Multi-byte entries ranked after the 256 single bytes, so that merges actually happen
const WORDS: &[&str] = &[
    "th", "he", "in", "er", "an", "re", "on", "ll", "lo", "or", "ld", " a", " t", " s", " w",
    "the", " the", "ing", "wor", "hello", " world", "'s", " is", "12", "123", "€", "🦀",
];

/// The vocabulary in the tiktoken text format
pub fn tiktoken_data() -> Vec<u8> {
    let entries = (0..=255u8)
        .map(|byte| vec![byte])
        .chain(WORDS.iter().map(|word| word.as_bytes().to_vec()));

    let mut data = String::new();
    for (rank, bytes) in entries.enumerate() {
        data.push_str(&format!("{} {rank}\n", general_purpose::STANDARD.encode(bytes)));
    }
    data.into_bytes()
}

pub fn encoding() -> &'static HarmonyEncoding {
    static ENCODING: OnceLock<HarmonyEncoding> = OnceLock::new();

    ENCODING.get_or_init(|| {
        let vocab = VocabularyTable::from_tiktoken(&tiktoken_data()).unwrap();
        HarmonyEncoding::o200k_harmony(vocab).unwrap()
    })
}
