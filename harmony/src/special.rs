//! Named tokens outside the merge vocabulary: role delimiters, message structure markers, stop
//! markers and the reserved block around them.
use crate::error::MisconfigurationSnafu;
use crate::vocab::HashMap;
use crate::{Result, Token};
use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use snafu::{ensure, OptionExt};
use std::collections::BTreeSet;
use strum::{EnumIter, IntoEnumIterator};

/// What role a special token plays when rendering and decoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SpecialTokenCategory {
    /// Opens a message; followed by the role label
    RoleDelimiter,

    /// Separates parts of a message (header from body, channel, constraint)
    Structural,

    /// Ends generation or a message.  These make up [`SpecialTokenRegistry::stop_tokens`]
    Stop,

    /// Start or end of a whole text
    Text,

    /// Held for future use; carries no meaning yet
    Reserved,
}

/// A special token: its literal form, reserved id and category.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SpecialToken {
    pub name: String,
    pub id: Token,
    pub category: SpecialTokenCategory,
}

impl SpecialToken {
    pub fn new(name: impl Into<String>, id: Token, category: SpecialTokenCategory) -> Self {
        Self {
            name: name.into(),
            id,
            category,
        }
    }
}

/// The special tokens harmony prompts are built from.
///
/// The string form of each variant is the literal token text.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, EnumIter, strum::Display, strum::IntoStaticStr,
)]
pub enum FormattingToken {
    #[strum(serialize = "<|startoftext|>")]
    StartOfText,
    #[strum(serialize = "<|endoftext|>")]
    EndOfText,
    #[strum(serialize = "<|return|>")]
    Return,
    #[strum(serialize = "<|constrain|>")]
    Constrain,
    #[strum(serialize = "<|channel|>")]
    Channel,
    #[strum(serialize = "<|start|>")]
    Start,
    #[strum(serialize = "<|end|>")]
    End,
    #[strum(serialize = "<|message|>")]
    Message,
    #[strum(serialize = "<|call|>")]
    Call,
}

impl FormattingToken {
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn category(self) -> SpecialTokenCategory {
        use FormattingToken::*;
        match self {
            StartOfText | EndOfText => SpecialTokenCategory::Text,
            Start => SpecialTokenCategory::RoleDelimiter,
            Message | Channel | Constrain => SpecialTokenCategory::Structural,
            End | Return | Call => SpecialTokenCategory::Stop,
        }
    }

    /// The id of this token in the o200k_harmony encoding
    pub fn o200k_harmony_id(self) -> Token {
        use FormattingToken::*;
        match self {
            StartOfText => 199_998,
            EndOfText => 199_999,
            Return => 200_002,
            Constrain => 200_003,
            Channel => 200_005,
            Start => 200_006,
            End => 200_007,
            Message => 200_008,
            Call => 200_012,
        }
    }
}

/// The reserved id block of o200k_harmony; ids in it without a [`FormattingToken`] are
/// `<|reserved_N|>`.
const O200K_HARMONY_RESERVED: std::ops::Range<Token> = 200_000..201_088;

/// All special tokens of an encoding, indexed by name and by id.
///
/// Immutable after construction and cheap to share behind the encoding's `Arc`.
#[derive(Clone, Debug)]
pub struct SpecialTokenRegistry {
    by_name: HashMap<String, Token>,
    by_id: HashMap<Token, SpecialToken>,

    /// A/C automaton for finding special tokens in text
    finder: AhoCorasick,

    /// Token for each pattern index of `finder`
    finder_tokens: Vec<Token>,
}

impl SpecialTokenRegistry {
    /// Build a registry.  Names and ids must both be unique.
    pub fn new(tokens: impl IntoIterator<Item = SpecialToken>) -> Result<Self> {
        let mut by_name = HashMap::default();
        let mut by_id = HashMap::default();

        for token in tokens {
            ensure!(
                !token.name.is_empty(),
                MisconfigurationSnafu {
                    reason: format!("special token {} has an empty name", token.id),
                }
            );
            if let Some(previous) = by_name.insert(token.name.clone(), token.id) {
                return MisconfigurationSnafu {
                    reason: format!(
                        "special token name {} is used by both {previous} and {}",
                        token.name, token.id
                    ),
                }
                .fail();
            }
            if let Some(previous) = by_id.insert(token.id, token) {
                return MisconfigurationSnafu {
                    reason: format!("special token id {} is assigned twice", previous.id),
                }
                .fail();
            }
        }

        // Sorted so pattern indices don't depend on hash iteration order
        let mut finder_entries = by_name
            .iter()
            .map(|(name, token)| (name.as_str(), *token))
            .collect::<Vec<_>>();
        finder_entries.sort_unstable_by_key(|(_, token)| *token);

        // Make an aho-corasick automaton that quickly finds any of the special tokens in text.
        // Leftmost-longest so a token that is a prefix of another never shadows it.
        let finder = AhoCorasickBuilder::new()
            .match_kind(MatchKind::LeftmostLongest)
            .dfa(true)
            .build(finder_entries.iter().map(|(name, _)| *name));
        let finder_tokens = finder_entries.iter().map(|(_, token)| *token).collect();

        Ok(Self {
            by_name,
            by_id,
            finder,
            finder_tokens,
        })
    }

    /// The special tokens of the o200k_harmony encoding: the harmony formatting tokens at their
    /// fixed ids, with every other id in the reserved block registered as `<|reserved_N|>`.
    pub fn o200k_harmony() -> Result<Self> {
        let formatting = FormattingToken::iter().map(|token| {
            SpecialToken::new(token.name(), token.o200k_harmony_id(), token.category())
        });

        let assigned = FormattingToken::iter()
            .map(FormattingToken::o200k_harmony_id)
            .collect::<BTreeSet<_>>();
        let reserved = O200K_HARMONY_RESERVED
            .filter(move |id| !assigned.contains(id))
            .map(|id| {
                SpecialToken::new(
                    format!("<|reserved_{id}|>"),
                    id,
                    SpecialTokenCategory::Reserved,
                )
            });

        Self::new(formatting.chain(reserved))
    }

    pub fn get(&self, id: Token) -> Option<&SpecialToken> {
        self.by_id.get(&id)
    }

    pub fn id_for_name(&self, name: &str) -> Option<Token> {
        self.by_name.get(name).copied()
    }

    pub fn contains(&self, id: Token) -> bool {
        self.by_id.contains_key(&id)
    }

    /// The id of a harmony formatting token.  Fails if this registry doesn't define it.
    pub fn formatting(&self, token: FormattingToken) -> Result<Token> {
        self.id_for_name(token.name())
            .with_context(|| MisconfigurationSnafu {
                reason: format!("special token {token} is not registered"),
            })
    }

    /// Every token tagged [`SpecialTokenCategory::Stop`].  Fails if there are none, since an
    /// encoding without stop tokens can't end a generation.
    pub fn stop_tokens(&self) -> Result<BTreeSet<Token>> {
        let stops = self
            .by_id
            .values()
            .filter(|token| token.category == SpecialTokenCategory::Stop)
            .map(|token| token.id)
            .collect::<BTreeSet<_>>();

        ensure!(
            !stops.is_empty(),
            MisconfigurationSnafu {
                reason: "no stop tokens are registered",
            }
        );
        Ok(stops)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// All special tokens, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &SpecialToken> {
        self.by_id.values()
    }

    /// Every occurrence of a special token's literal text in `text`, as `(byte range, token)`.
    pub fn find_iter<'me, 'text>(
        &'me self,
        text: &'text str,
    ) -> impl Iterator<Item = (std::ops::Range<usize>, Token)> + 'text
    where
        'me: 'text,
    {
        self.finder
            .find_iter(text)
            .map(move |m| (m.start()..m.end(), self.finder_tokens[m.pattern()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HarmonyError;
    use assert_matches::assert_matches;

    #[test]
    fn o200k_harmony_layout() {
        let registry = SpecialTokenRegistry::o200k_harmony().unwrap();

        assert_eq!(2 + 1088, registry.len());
        assert_eq!(Some(200_006), registry.id_for_name("<|start|>"));
        assert_eq!(Some(200_001), registry.id_for_name("<|reserved_200001|>"));
        assert_eq!(
            SpecialTokenCategory::Structural,
            registry.get(200_008).unwrap().category
        );
        assert!(registry.id_for_name("<|reserved_200006|>").is_none());
        assert_eq!(200_007, registry.formatting(FormattingToken::End).unwrap());
    }

    #[test]
    fn stop_tokens_are_return_call_end() {
        let registry = SpecialTokenRegistry::o200k_harmony().unwrap();

        assert_eq!(
            BTreeSet::from([200_002, 200_007, 200_012]),
            registry.stop_tokens().unwrap()
        );
    }

    #[test]
    fn empty_registry_has_no_stop_tokens() {
        let registry = SpecialTokenRegistry::new([]).unwrap();

        assert_matches!(
            registry.stop_tokens(),
            Err(HarmonyError::Misconfiguration { .. })
        );
        assert_matches!(
            registry.formatting(FormattingToken::Start),
            Err(HarmonyError::Misconfiguration { .. })
        );
    }

    #[test]
    fn duplicates_are_rejected() {
        let result = SpecialTokenRegistry::new([
            SpecialToken::new("<|a|>", 1, SpecialTokenCategory::Stop),
            SpecialToken::new("<|b|>", 1, SpecialTokenCategory::Stop),
        ]);
        assert_matches!(result, Err(HarmonyError::Misconfiguration { .. }));

        let result = SpecialTokenRegistry::new([
            SpecialToken::new("<|a|>", 1, SpecialTokenCategory::Stop),
            SpecialToken::new("<|a|>", 2, SpecialTokenCategory::Stop),
        ]);
        assert_matches!(result, Err(HarmonyError::Misconfiguration { .. }));
    }

    #[test]
    fn finds_tokens_in_text() {
        let registry = SpecialTokenRegistry::o200k_harmony().unwrap();
        let text = "a<|start|>b<|end|><|bogus|>";

        let found = registry.find_iter(text).collect::<Vec<_>>();

        assert_eq!(vec![(1..10, 200_006), (11..18, 200_007)], found);
    }
}
