//! The choice of hash algorithm and hash function used to maintain the lookup tables mapping byte
//! strings and token pairs to token ids has a big impact on performance.
//!
//! This is isolated to this module to make it easier to experiment with different impls.
use crate::token::{Rank, Token, TokenBytes};

pub use rustc_hash::FxHashMap as HashMap;

/// Maps byte sequences to the ids of the tokens they spell.
#[derive(Clone, Debug, Default)]
pub struct TokenEncoder(HashMap<TokenBytes, Token>);

/// The reverse mapping, from the integer representation of a token to its byte sequence.
#[derive(Clone, Debug, Default)]
pub struct TokenDecoder(HashMap<Token, TokenBytes>);

/// The result of fusing two adjacent tokens.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Merge {
    /// Priority of this merge; lower merges first
    pub rank: Rank,

    /// The token that replaces the pair
    pub token: Token,
}

/// Pairwise merge ranks, keyed by the (left, right) token ids.
#[derive(Clone, Debug, Default)]
pub struct MergeTable(HashMap<(Token, Token), Merge>);

impl TokenEncoder {
    pub fn token_for_bytes(&self, bytes: impl AsRef<[u8]>) -> Option<Token> {
        self.0.get(bytes.as_ref()).copied()
    }

    /// Returns the previous token for `bytes`, if there was one
    pub fn insert(&mut self, bytes: TokenBytes, token: Token) -> Option<Token> {
        self.0.insert(bytes, token)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// All byte strings in the encoder
    pub fn token_bytes(&self) -> impl Iterator<Item = &TokenBytes> {
        self.0.keys()
    }
}

impl TokenDecoder {
    pub fn bytes_for_token(&self, token: Token) -> Option<&TokenBytes> {
        self.0.get(&token)
    }

    /// Without copying the bytes of this token, return their length.
    pub fn token_len(&self, token: Token) -> Option<usize> {
        self.bytes_for_token(token).map(TokenBytes::len)
    }

    pub fn insert(&mut self, token: Token, bytes: TokenBytes) -> Option<TokenBytes> {
        self.0.insert(token, bytes)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.0.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn tokens(&self) -> impl Iterator<Item = (Token, &TokenBytes)> {
        self.0.iter().map(|(token, bytes)| (*token, bytes))
    }
}

impl MergeTable {
    pub fn get(&self, left: Token, right: Token) -> Option<Merge> {
        self.0.get(&(left, right)).copied()
    }

    /// Returns the merge previously registered for this pair, if any
    pub fn insert(&mut self, left: Token, right: Token, merge: Merge) -> Option<Merge> {
        self.0.insert((left, right), merge)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
