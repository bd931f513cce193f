use crate::SpecialTokenCategory;

/// A token output by the tokenizer, in its integer form.
///
/// Ordinary tokens are the ids of entries in a [`crate::VocabularyTable`].  Special tokens live
/// in a reserved range owned by a [`crate::SpecialTokenRegistry`] and never collide with ordinary
/// ids.  `u32` matches the width used on the C boundary, so token buffers can be handed across
/// without conversion.
pub type Token = u32;

/// The priority of a merge.  Lower values merge earlier.
pub type Rank = u32;

/// A token in its byte string form.
///
/// Users of tokenizing libraries usually are interested in the integer representation, as defined
/// by [`Token`], but the vocabulary needs the byte form for lookups and decoding.
pub type TokenBytes = Vec<u8>;

/// What a token id means to a particular encoding.
///
/// Resolved with [`crate::HarmonyEncoding::classify`] at the few places that treat ordinary and
/// special tokens differently (decode rendering, stop token checks).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TokenKind {
    /// A token from the merge vocabulary
    Ordinary(Token),

    /// A reserved token from the special token registry
    Special(Token, SpecialTokenCategory),
}

impl TokenKind {
    pub fn token(&self) -> Token {
        match self {
            TokenKind::Ordinary(token) | TokenKind::Special(token, _) => *token,
        }
    }

    pub fn is_special(&self) -> bool {
        matches!(self, TokenKind::Special(..))
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, TokenKind::Special(_, SpecialTokenCategory::Stop))
    }
}
