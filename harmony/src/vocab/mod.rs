use crate::error::InvalidVocabularySnafu;
use crate::{Rank, Result, Token, TokenBytes};
use snafu::{ensure, OptionExt};
use std::time::Instant;
use tracing::*;

mod data;
mod hash;

pub use data::parse_tiktoken;
pub(crate) use hash::HashMap;
pub use hash::Merge;
use hash::{MergeTable, TokenDecoder, TokenEncoder};

/// The immutable mapping between byte sequences and ordinary token ids, plus the pairwise merge
/// ranks that drive byte pair encoding.
///
/// Built once, then shared read-only.  Every lookup is by exact byte match or exact id.
///
/// Two construction paths exist:
///
/// - [`Self::from_ranks`] (and [`Self::from_tiktoken`]) take a ranked list of byte sequences, the
///   way tiktoken vocabularies are distributed.  Merge ranks are implied: fusing two tokens is
///   allowed if their concatenated bytes are themselves a token, at that token's rank.
/// - [`Self::builder`] takes tokens and merges explicitly, for vocabularies whose merge order is
///   not a function of the merged bytes.
#[derive(Clone, Debug)]
pub struct VocabularyTable {
    encode: TokenEncoder,
    decode: TokenDecoder,
    merges: MergeTable,

    /// The token for each single byte value, if the vocabulary has one
    byte_tokens: [Option<Token>; 256],

    /// One past the highest ordinary token id
    vocab_size: Token,

    /// The mean length of a token in bytes.
    ///
    /// This is used when we need to estimate how many tokens are likely to be in a string.
    mean_token_len: usize,

    /// Whether a chunk that spells a token can be encoded as that token without merging.  Holds
    /// for ranked vocabularies, where every token is reachable by merging its own bytes; explicit
    /// merge graphs make no such promise.
    shortcut_whole_chunks: bool,
}

impl VocabularyTable {
    /// Build a vocabulary from an ordered list of `(bytes, rank)` entries.
    ///
    /// Token ids are assigned by position in the list.  For a pair of adjacent tokens `a` and `b`,
    /// the merge rank is the rank of the entry spelling `bytes(a) ++ bytes(b)`, and the merge
    /// produces that entry's token.
    pub fn from_ranks<I, B>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (B, Rank)>,
        B: Into<TokenBytes>,
    {
        let started = Instant::now();
        let mut encode = TokenEncoder::default();
        let mut decode = TokenDecoder::default();
        let mut ranks = Vec::new();

        for (index, (bytes, rank)) in entries.into_iter().enumerate() {
            let token = Token::try_from(index).map_err(|_| {
                InvalidVocabularySnafu {
                    reason: format!("entry {index} does not fit in a token id"),
                }
                .build()
            })?;
            insert_token(&mut encode, &mut decode, token, bytes.into())?;
            ranks.push(rank);
        }

        // Every way of splitting a token into two shorter tokens is a merge that produces it.
        let mut merges = MergeTable::default();
        for (token, bytes) in decode.tokens() {
            for split in 1..bytes.len() {
                let left = encode.token_for_bytes(&bytes[..split]);
                let right = encode.token_for_bytes(&bytes[split..]);
                if let (Some(left), Some(right)) = (left, right) {
                    let rank = ranks[token as usize];
                    merges.insert(left, right, Merge { rank, token });
                }
            }
        }

        let vocab = Self::assemble(encode, decode, merges, true);
        debug!(
            tokens = vocab.len(),
            merges = vocab.merges.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Built vocabulary from ranked entries"
        );
        Ok(vocab)
    }

    /// Start building a vocabulary from explicit tokens and merges.
    pub fn builder() -> VocabularyBuilder {
        VocabularyBuilder::default()
    }

    fn assemble(
        encode: TokenEncoder,
        decode: TokenDecoder,
        merges: MergeTable,
        shortcut_whole_chunks: bool,
    ) -> Self {
        let mut byte_tokens = [None; 256];
        for (slot, byte) in byte_tokens.iter_mut().zip(0u8..=255) {
            *slot = encode.token_for_bytes([byte]);
        }

        let vocab_size = decode
            .tokens()
            .map(|(token, _)| token.saturating_add(1))
            .max()
            .unwrap_or(0);

        // Calculate the average length of the tokens
        let total_len = encode
            .token_bytes()
            .map(|bytes| bytes.len() as u64)
            .sum::<u64>();
        let mean_token_len = (total_len / encode.len().max(1) as u64).max(1) as usize;

        Self {
            encode,
            decode,
            merges,
            byte_tokens,
            vocab_size,
            mean_token_len,
            shortcut_whole_chunks,
        }
    }

    /// The ordinary token spelled exactly by `bytes`, if there is one.
    pub fn lookup_id(&self, bytes: impl AsRef<[u8]>) -> Option<Token> {
        self.encode.token_for_bytes(bytes)
    }

    /// The token a whole pre-token chunk encodes to without running any merges, if that is known
    /// up front.  Only ranked vocabularies answer this; for explicit merge graphs the chunk
    /// spelling a token says nothing about whether merging reaches it.
    pub(crate) fn whole_chunk_token(&self, chunk: impl AsRef<[u8]>) -> Option<Token> {
        if self.shortcut_whole_chunks {
            self.lookup_id(chunk)
        } else {
            None
        }
    }

    /// The bytes of an ordinary token.
    pub fn lookup_bytes(&self, token: Token) -> Result<&[u8]> {
        self.decode
            .bytes_for_token(token)
            .map(Vec::as_slice)
            .context(crate::error::UnknownTokenSnafu { token })
    }

    /// The rank of fusing `left` followed by `right`, or `None` if that pair never merges.
    pub fn rank(&self, left: Token, right: Token) -> Option<Rank> {
        self.merges.get(left, right).map(|merge| merge.rank)
    }

    /// The full merge (rank and resulting token) for a pair, if the pair merges.
    pub fn merge(&self, left: Token, right: Token) -> Option<Merge> {
        self.merges.get(left, right)
    }

    /// The token for a single byte value.
    #[inline]
    pub fn byte_token(&self, byte: u8) -> Option<Token> {
        self.byte_tokens[byte as usize]
    }

    /// Without copying the bytes of this token, return their length.
    pub fn token_len(&self, token: Token) -> Option<usize> {
        self.decode.token_len(token)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.decode.contains(token)
    }

    /// Number of ordinary tokens
    pub fn len(&self) -> usize {
        self.decode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the highest ordinary token id.  Ids at or above this are never ordinary tokens.
    pub fn vocab_size(&self) -> Token {
        self.vocab_size
    }

    /// Every ordinary token and its bytes, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (Token, &[u8])> {
        self.decode
            .tokens()
            .map(|(token, bytes)| (token, bytes.as_slice()))
    }

    /// Make an educated guess as to the number of tokens `len` bytes of text will produce.
    pub fn estimate_num_tokens(&self, len: usize) -> usize {
        // Use a dumb strategy: we know the mean length of a token in this vocabulary, and assume
        // the text is full of the mean tokens.
        (len + self.mean_token_len - 1) / self.mean_token_len
    }
}

/// Explicit construction of a [`VocabularyTable`].
///
/// Merges are checked in the order they are added: both operands must already be defined,
/// either as a plain token or as the result of an earlier merge.
#[derive(Clone, Debug, Default)]
pub struct VocabularyBuilder {
    tokens: Vec<(Token, TokenBytes)>,
    merges: Vec<(Token, Token, Token, Rank)>,
}

impl VocabularyBuilder {
    pub fn token(mut self, token: Token, bytes: impl Into<TokenBytes>) -> Self {
        self.tokens.push((token, bytes.into()));
        self
    }

    /// Declare that `left` followed by `right` fuses into `merged` with priority `rank`.
    pub fn merge(mut self, left: Token, right: Token, merged: Token, rank: Rank) -> Self {
        self.merges.push((left, right, merged, rank));
        self
    }

    pub fn build(self) -> Result<VocabularyTable> {
        let mut encode = TokenEncoder::default();
        let mut decode = TokenDecoder::default();

        for (token, bytes) in self.tokens {
            insert_token(&mut encode, &mut decode, token, bytes)?;
        }

        let mut merges = MergeTable::default();
        for (left, right, merged, rank) in self.merges {
            let mut bytes = decode.bytes_for_token(left).cloned().with_context(|| {
                InvalidVocabularySnafu {
                    reason: format!("merge ({left}, {right}) uses undefined token {left}"),
                }
            })?;
            let right_bytes = decode.bytes_for_token(right).with_context(|| {
                InvalidVocabularySnafu {
                    reason: format!("merge ({left}, {right}) uses undefined token {right}"),
                }
            })?;
            bytes.extend_from_slice(right_bytes);

            match decode.bytes_for_token(merged) {
                Some(existing) => ensure!(
                    *existing == bytes,
                    InvalidVocabularySnafu {
                        reason: format!(
                            "merge ({left}, {right}) produces token {merged}, which already spells different bytes"
                        ),
                    }
                ),
                None => insert_token(&mut encode, &mut decode, merged, bytes)?,
            }

            if merges
                .insert(left, right, Merge { rank, token: merged })
                .is_some()
            {
                return InvalidVocabularySnafu {
                    reason: format!("pair ({left}, {right}) is merged more than once"),
                }
                .fail();
            }
        }

        Ok(VocabularyTable::assemble(encode, decode, merges, false))
    }
}

fn insert_token(
    encode: &mut TokenEncoder,
    decode: &mut TokenDecoder,
    token: Token,
    bytes: TokenBytes,
) -> Result<()> {
    ensure!(
        !bytes.is_empty(),
        InvalidVocabularySnafu {
            reason: format!("token {token} has an empty byte sequence"),
        }
    );
    ensure!(
        !decode.contains(token),
        InvalidVocabularySnafu {
            reason: format!("token {token} is defined more than once"),
        }
    );
    if let Some(previous) = encode.insert(bytes.clone(), token) {
        return InvalidVocabularySnafu {
            reason: format!("tokens {previous} and {token} share the byte sequence {bytes:?}"),
        }
        .fail();
    }
    decode.insert(token, bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HarmonyError;
    use crate::test_helpers::{byte_level_vocab, toy_vocab};
    use assert_matches::assert_matches;

    #[test]
    fn ranked_entries_get_ids_in_order() {
        let vocab = VocabularyTable::from_ranks([
            (b"a".to_vec(), 0),
            (b"b".to_vec(), 1),
            (b"ab".to_vec(), 2),
        ])
        .unwrap();

        assert_eq!(Some(0), vocab.lookup_id(b"a"));
        assert_eq!(Some(2), vocab.lookup_id(b"ab"));
        assert_eq!(b"ab", vocab.lookup_bytes(2).unwrap());
        assert_eq!(3, vocab.vocab_size());
        assert_eq!(Some(2), vocab.rank(0, 1));
        assert_eq!(None, vocab.rank(1, 0));
    }

    #[test]
    fn ranked_merges_cover_every_split() {
        let vocab = VocabularyTable::from_ranks([
            (b"a".to_vec(), 0),
            (b"b".to_vec(), 1),
            (b"c".to_vec(), 2),
            (b"ab".to_vec(), 3),
            (b"bc".to_vec(), 4),
            (b"abc".to_vec(), 5),
        ])
        .unwrap();

        assert_eq!(Some(Merge { rank: 5, token: 5 }), vocab.merge(3, 2));
        assert_eq!(Some(Merge { rank: 5, token: 5 }), vocab.merge(0, 4));
    }

    #[test]
    fn unknown_token_lookup_fails() {
        let vocab = toy_vocab();
        assert_matches!(
            vocab.lookup_bytes(4),
            Err(HarmonyError::UnknownToken { token: 4 })
        );
        assert!(vocab.lookup_id(b"z").is_none());
    }

    #[test]
    fn builder_concatenates_merged_bytes() {
        let vocab = toy_vocab();

        assert_eq!(b"he", vocab.lookup_bytes(10).unwrap());
        assert_eq!(b"ll", vocab.lookup_bytes(11).unwrap());
        assert_eq!(b"hel", vocab.lookup_bytes(12).unwrap());
        assert_eq!(Some(1), vocab.rank(2, 2));
        assert_eq!(None, vocab.rank(10, 11));
        assert_eq!(13, vocab.vocab_size());
    }

    #[test]
    fn builder_rejects_merge_of_undefined_token() {
        let result = VocabularyTable::builder()
            .token(0, b"a".to_vec())
            .merge(0, 1, 2, 0)
            .build();

        assert_matches!(result, Err(HarmonyError::InvalidVocabulary { .. }));
    }

    #[test]
    fn duplicate_bytes_are_rejected() {
        let result = VocabularyTable::from_ranks([(b"a".to_vec(), 0), (b"a".to_vec(), 1)]);
        assert_matches!(result, Err(HarmonyError::InvalidVocabulary { .. }));

        let result = VocabularyTable::builder()
            .token(0, b"a".to_vec())
            .token(1, b"b".to_vec())
            .token(2, b"ab".to_vec())
            .merge(0, 1, 3, 0)
            .build();
        assert_matches!(result, Err(HarmonyError::InvalidVocabulary { .. }));
    }

    #[test]
    fn estimate_rounds_up() {
        let vocab = byte_level_vocab(&[]);
        assert_eq!(1, vocab.mean_token_len);
        assert_eq!(5, vocab.estimate_num_tokens(5));
        assert_eq!(0, vocab.estimate_num_tokens(0));
    }
}
