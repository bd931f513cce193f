//! Lazy plain-text encoding, implemented as a Rust [`Iterator`].

use crate::segment::Segments;
use crate::{bpe, Result, Token, VocabularyTable};
use std::collections::VecDeque;

/// The iterator which yields the tokens of a text encoded without regard for special tokens.
///
/// Items are fallible because a chunk can contain a byte the vocabulary has no token for.  After
/// the first error the iterator is exhausted.
///
/// See [`crate::HarmonyEncoding::encode_plain_iter`]
pub struct EncodePlainIterator<'a> {
    vocab: &'a VocabularyTable,
    chunks: Segments<'a>,

    /// Tokens found in the current chunk, if the chunk itself didn't map directly to a token.
    /// If there are any tokens here, they're taken from the front one iteration at a time
    current_chunk_tokens: VecDeque<Token>,

    failed: bool,
}

impl<'a> EncodePlainIterator<'a> {
    pub(crate) fn new(vocab: &'a VocabularyTable, chunks: Segments<'a>) -> Self {
        Self {
            vocab,
            chunks,
            current_chunk_tokens: VecDeque::new(),
            failed: false,
        }
    }
}

impl<'a> Iterator for EncodePlainIterator<'a> {
    type Item = Result<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        // If there are still tokens left from a previously encoded chunk, use one of them
        if let Some(token) = self.current_chunk_tokens.pop_front() {
            return Some(Ok(token));
        }
        if self.failed {
            return None;
        }

        let result = match self.chunks.next()? {
            Ok(chunk) => match self.vocab.whole_chunk_token(chunk) {
                // Easy, the chunk is a token
                Some(token) => return Some(Ok(token)),
                None => bpe::byte_pair_encode(chunk.as_bytes(), self.vocab),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(tokens) => {
                self.current_chunk_tokens.extend(tokens);
                self.current_chunk_tokens.pop_front().map(Ok)
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
