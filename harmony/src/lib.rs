//! Byte pair encoding for the harmony prompt format.
//!
//! A [`HarmonyEncoding`] bundles a [`VocabularyTable`] of ordinary tokens, a
//! [`SpecialTokenRegistry`] of reserved tokens and a [`TextSegmenter`].  With it you can encode
//! text, render system/user/assistant prompts into tokens, decode tokens back into text and, via
//! [`StreamableParser`], encode text that arrives in arbitrary pieces.
//!
//! Vocabularies are not bundled.  Load one in the tiktoken text format with
//! [`VocabularyTable::from_tiktoken`] or build one with [`VocabularyTable::builder`].
pub mod bpe;
mod chat;
mod encoding;
mod error;
mod iterator;
mod parser;
mod segment;
mod special;
mod token;
mod vocab;

pub use chat::*;
pub use encoding::{HarmonyEncoding, SpecialTokenDisplay};
pub use error::{ErrorKind, HarmonyError};
pub use iterator::*;
pub use parser::*;
pub use segment::*;
pub use special::*;
pub use token::*;
pub use vocab::{parse_tiktoken, Merge, VocabularyBuilder, VocabularyTable};

pub type Result<T, E = HarmonyError> = std::result::Result<T, E>;

#[cfg(test)]
pub mod test_helpers {
    use crate::{HarmonyEncoding, Rank, VocabularyTable};
    use std::sync::OnceLock;
    use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

    static TRACING: OnceLock<()> = OnceLock::new();

    /// Initialize tracing for tests with a stdout subscriber.
    /// Safe to call multiple times - will only initialize once.
    pub fn init_test_logging() {
        TRACING.get_or_init(|| {
            let filter = std::env::var("RUST_LOG")
                .map(EnvFilter::new)
                .unwrap_or_else(|_| EnvFilter::new("debug"));

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_test_writer()
                .try_init()
                .ok();
        });
    }

    /// Four letters and three explicit merges:
    ///
    /// | id | bytes | from     | rank |
    /// |----|-------|----------|------|
    /// | 0  | h     |          |      |
    /// | 1  | e     |          |      |
    /// | 2  | l     |          |      |
    /// | 3  | o     |          |      |
    /// | 10 | he    | (0, 1)   | 0    |
    /// | 11 | ll    | (2, 2)   | 1    |
    /// | 12 | hel   | (10, 2)  | 2    |
    pub fn toy_vocab() -> VocabularyTable {
        VocabularyTable::builder()
            .token(0, b"h".to_vec())
            .token(1, b"e".to_vec())
            .token(2, b"l".to_vec())
            .token(3, b"o".to_vec())
            .merge(0, 1, 10, 0)
            .merge(2, 2, 11, 1)
            .merge(10, 2, 12, 2)
            .build()
            .unwrap()
    }

    /// Every single byte (id = byte value), then `words` in order, ranked by position.
    pub fn byte_level_vocab(words: &[&str]) -> VocabularyTable {
        let bytes = (0..=255u8).map(|byte| (vec![byte], byte as Rank));
        let words = words
            .iter()
            .enumerate()
            .map(|(i, word)| (word.as_bytes().to_vec(), 256 + i as Rank));

        VocabularyTable::from_ranks(bytes.chain(words)).unwrap()
    }

    /// o200k_harmony specials and segmentation over a small byte level vocabulary, so any text
    /// can be encoded.
    pub fn test_encoding() -> HarmonyEncoding {
        HarmonyEncoding::o200k_harmony(byte_level_vocab(&[
            "he", "ll", "lo", "hel", "hello", " w", "or", "ld", " world", "on", "one", " t", "wo",
            " two", "th", "ree", " three", "ab",
        ]))
        .unwrap()
    }
}
