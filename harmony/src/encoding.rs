use crate::chat::Message;
use crate::error::{AllocationFailureSnafu, MisconfigurationSnafu, UnknownTokenSnafu};
use crate::iterator::EncodePlainIterator;
use crate::special::FormattingToken;
use crate::{
    bpe, Result, SpecialTokenRegistry, StreamableParser, TextSegmenter, Token, TokenKind,
    VocabularyTable,
};
use snafu::{OptionExt, ResultExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::*;

/// What [`HarmonyEncoding::decode`] does with special tokens.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SpecialTokenDisplay {
    /// Emit the token's literal text, eg `<|start|>`
    #[default]
    Render,

    /// Emit nothing for special tokens
    Drop,
}

/// Everything an encoding needs, immutable once built and shared by every clone.
struct EncodingParams {
    name: String,
    vocab: VocabularyTable,
    specials: SpecialTokenRegistry,
    segmenter: TextSegmenter,
}

/// A complete text encoding: vocabulary, special tokens and segmentation pattern.
///
/// With this encoding, it's possible to tokenize text, render structured prompts to tokens, and
/// decode tokens back into text.
///
/// Instances of `HarmonyEncoding` are light weight and can be very cheaply cloned.  They are also
/// thread safe; a single instance can be used to encode or decode text in multiple threads
/// simultaneously, although with Rust ownership rules it's usually more convenient to make a
/// clone of the encoding for each thread.
#[derive(Clone)]
pub struct HarmonyEncoding {
    params: Arc<EncodingParams>,
    special_token_display: SpecialTokenDisplay,
}

impl std::fmt::Debug for HarmonyEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarmonyEncoding")
            .field("name", &self.params.name)
            .field("vocab_size", &self.params.vocab.vocab_size())
            .field("special_tokens", &self.params.specials.len())
            .field("special_token_display", &self.special_token_display)
            .finish()
    }
}

impl HarmonyEncoding {
    /// Assemble an encoding from its parts.
    ///
    /// Fails with `Misconfiguration` if any special token id is also an ordinary token id.
    pub fn new(
        name: impl Into<String>,
        vocab: VocabularyTable,
        specials: SpecialTokenRegistry,
        segmenter: TextSegmenter,
    ) -> Result<Self> {
        let name = name.into();

        if let Some(clash) = specials
            .iter()
            .map(|special| special.id)
            .filter(|id| vocab.contains(*id))
            .min()
        {
            return MisconfigurationSnafu {
                reason: format!("special token id {clash} is also an ordinary token"),
            }
            .fail();
        }

        debug!(
            %name,
            ordinary_tokens = vocab.len(),
            special_tokens = specials.len(),
            "Created encoding"
        );

        Ok(Self {
            params: Arc::new(EncodingParams {
                name,
                vocab,
                specials,
                segmenter,
            }),
            special_token_display: SpecialTokenDisplay::default(),
        })
    }

    /// The o200k_harmony encoding over a loaded vocabulary: the o200k segmentation pattern and
    /// the harmony special tokens.
    pub fn o200k_harmony(vocab: VocabularyTable) -> Result<Self> {
        Self::new(
            "o200k_harmony",
            vocab,
            SpecialTokenRegistry::o200k_harmony()?,
            TextSegmenter::o200k()?,
        )
    }

    /// Choose how decoding treats special tokens.  Returns a new handle; the shared tables are
    /// not copied.
    pub fn with_special_token_display(mut self, display: SpecialTokenDisplay) -> Self {
        self.special_token_display = display;
        self
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn vocab(&self) -> &VocabularyTable {
        &self.params.vocab
    }

    pub fn special_tokens(&self) -> &SpecialTokenRegistry {
        &self.params.specials
    }

    pub fn segmenter(&self) -> &TextSegmenter {
        &self.params.segmenter
    }

    pub fn special_token_display(&self) -> SpecialTokenDisplay {
        self.special_token_display
    }

    /// Make an educated guess as to the number of likely tokens in a given bit of text.
    ///
    /// This is not a precise calculation, but it's a good enough estimate for most purposes.  For
    /// example if you want to pre-allocate a Vec to hold the tokens for a string, this is a good
    /// choice for the target capacity.
    pub fn estimate_num_tokens(&self, text: impl AsRef<str>) -> usize {
        self.params.vocab.estimate_num_tokens(text.as_ref().len())
    }

    /// Search the given input text for special tokens, returning an iterator that yields all
    /// special tokens in the input text.
    ///
    /// If you just need to know if there are any special tokens in the text, you can call
    /// [`Iterator::any`]
    pub fn find_special_tokens<'me, 'text>(
        &'me self,
        text: &'text str,
    ) -> impl Iterator<Item = &'text str> + 'text
    where
        'me: 'text,
    {
        self.params
            .specials
            .find_iter(text)
            .map(move |(range, _)| &text[range])
    }

    /// Encode the specified text into a sequence of ordinary tokens.
    ///
    /// Special token text is not recognized here: `"<|end|>"` in `text` is encoded like any other
    /// text and broken up into subword tokens.  Use [`Self::encode_with_special_tokens`] if that's
    /// not what you want.
    pub fn encode_plain(&self, text: &str) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        self.encode_plain_into(text, &mut tokens)?;
        Ok(tokens)
    }

    /// Lazy version of [`Self::encode_plain`].  Chunks are encoded as the iterator reaches them.
    pub fn encode_plain_iter<'a>(&'a self, text: &'a str) -> EncodePlainIterator<'a> {
        EncodePlainIterator::new(&self.params.vocab, self.params.segmenter.segment(text))
    }

    /// Encode text, mapping every occurrence of a registered special token's literal text to that
    /// special token.  The text between occurrences is encoded as with [`Self::encode_plain`].
    ///
    /// If you want to detect text that contains certain special tokens, to avoid abuse of the
    /// model, use [`Self::find_special_tokens`] to scan input first and take whatever action you
    /// need if any are found.
    pub fn encode_with_special_tokens(&self, text: &str) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        let mut last = 0;

        for (range, token) in self.params.specials.find_iter(text) {
            self.encode_plain_into(&text[last..range.start], &mut tokens)?;
            tokens.push(token);
            last = range.end;
        }
        self.encode_plain_into(&text[last..], &mut tokens)?;

        Ok(tokens)
    }

    /// Encode `text` and append the tokens to `out`.  On failure `out` may hold a partial
    /// encoding.
    pub(crate) fn encode_plain_into(&self, text: &str, out: &mut Vec<Token>) -> Result<()> {
        reserve_tokens(out, self.estimate_num_tokens(text))?;

        for chunk in self.params.segmenter.segment(text) {
            bpe::encode_chunk(chunk?.as_bytes(), &self.params.vocab, out)?;
        }
        Ok(())
    }

    /// Render a system message, a user message and the start of the assistant's reply.
    ///
    /// The layout is
    ///
    /// ```text
    /// <|start|>system<|message|>{system}<|end|><|start|>user<|message|>{user}<|end|><|start|>assistant<|message|>{assistant_prefix}
    /// ```
    ///
    /// with no `<|end|>` after the assistant prefix, so the model continues from there.
    pub fn render_prompt(
        &self,
        system: &str,
        user: &str,
        assistant_prefix: &str,
    ) -> Result<Vec<Token>> {
        self.render_conversation(
            &[Message::system(system), Message::user(user)],
            Some(&Message::assistant(assistant_prefix)),
        )
    }

    /// Render complete messages, each closed with `<|end|>`, optionally followed by one open
    /// message that is left without its `<|end|>`.
    ///
    /// Empty message content still renders the role label and both delimiters.
    pub fn render_conversation(
        &self,
        messages: &[Message],
        open: Option<&Message>,
    ) -> Result<Vec<Token>> {
        let end = self.params.specials.formatting(FormattingToken::End)?;

        let mut tokens = Vec::new();
        for message in messages {
            self.render_message_into(message, &mut tokens)?;
            tokens.push(end);
        }
        if let Some(message) = open {
            self.render_message_into(message, &mut tokens)?;
        }

        trace!(
            messages = messages.len(),
            open = open.is_some(),
            tokens = tokens.len(),
            "Rendered conversation"
        );
        Ok(tokens)
    }

    fn render_message_into(&self, message: &Message, out: &mut Vec<Token>) -> Result<()> {
        let specials = &self.params.specials;

        out.push(specials.formatting(FormattingToken::Start)?);
        self.encode_plain_into(message.role.as_ref(), out)?;
        out.push(specials.formatting(FormattingToken::Message)?);
        self.encode_plain_into(&message.content, out)
    }

    /// Whether `token` is an ordinary or special token of this encoding.
    pub fn classify(&self, token: Token) -> Result<TokenKind> {
        if self.params.vocab.contains(token) {
            return Ok(TokenKind::Ordinary(token));
        }
        self.params
            .specials
            .get(token)
            .map(|special| TokenKind::Special(token, special.category))
            .context(UnknownTokenSnafu { token })
    }

    /// Decode tokens into the bytes they came from.
    ///
    /// Special tokens are rendered or dropped according to [`Self::special_token_display`].
    /// Fails with `UnknownToken` on any id this encoding doesn't define.
    pub fn decode_bytes(&self, tokens: &[Token]) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(tokens.len() * 4);
        for &token in tokens {
            self.append_token_bytes(token, &mut bytes)?;
        }
        Ok(bytes)
    }

    /// Decode tokens into text.
    ///
    /// Encoders can break a valid UTF-8 string into subword tokens that are not valid UTF-8 on
    /// their own, so a truncated or edited token sequence may not decode cleanly.  Invalid
    /// sequences are replaced with U+FFFD rather than failing.
    pub fn decode(&self, tokens: &[Token]) -> Result<String> {
        let bytes = self.decode_bytes(tokens)?;
        Ok(into_string_lossy(bytes))
    }

    /// Like [`Self::decode`] but never fails: unknown ids decode to U+FFFD.
    pub fn decode_lossy(&self, tokens: &[Token]) -> String {
        let mut bytes = Vec::with_capacity(tokens.len() * 4);
        let mut unknown = 0usize;

        for &token in tokens {
            if self.append_token_bytes(token, &mut bytes).is_err() {
                unknown += 1;
                bytes.extend_from_slice("\u{FFFD}".as_bytes());
            }
        }
        if unknown > 0 {
            warn!(unknown, "Replaced unknown tokens while decoding");
        }

        into_string_lossy(bytes)
    }

    fn append_token_bytes(&self, token: Token, bytes: &mut Vec<u8>) -> Result<()> {
        match self.classify(token)? {
            TokenKind::Ordinary(token) => {
                bytes.extend_from_slice(self.params.vocab.lookup_bytes(token)?);
            }
            TokenKind::Special(token, _) => {
                if self.special_token_display == SpecialTokenDisplay::Render {
                    let special = self
                        .params
                        .specials
                        .get(token)
                        .context(UnknownTokenSnafu { token })?;
                    bytes.extend_from_slice(special.name.as_bytes());
                }
            }
        }
        Ok(())
    }

    /// The tokens that end a message or generation.  Never empty.
    pub fn stop_tokens(&self) -> Result<BTreeSet<Token>> {
        self.params.specials.stop_tokens()
    }

    pub fn is_stop_token(&self, token: Token) -> bool {
        matches!(self.classify(token), Ok(kind) if kind.is_stop())
    }

    /// A new streaming parser over this encoding.
    pub fn parser(&self) -> StreamableParser {
        StreamableParser::new(self.clone())
    }
}

/// Grow `out` by `additional` tokens, reporting allocation failure instead of aborting.
pub(crate) fn reserve_tokens(out: &mut Vec<Token>, additional: usize) -> Result<()> {
    out.try_reserve(additional)
        .context(AllocationFailureSnafu { count: additional })
}

fn into_string_lossy(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            debug!(
                valid_up_to = e.utf8_error().valid_up_to(),
                "Decoded bytes are not valid UTF-8"
            );
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{init_test_logging, test_encoding};
    use crate::{HarmonyError, SpecialToken, SpecialTokenCategory};
    use assert_matches::assert_matches;

    const START: Token = 200_006;
    const MESSAGE: Token = 200_008;
    const END: Token = 200_007;

    #[test]
    fn plain_round_trip() {
        init_test_logging();
        let encoding = test_encoding();

        for text in ["", "hello world", "Hello, world!\n\n  tabs\tand 12345 digits", "ünïcödé 🦀"] {
            let tokens = encoding.encode_plain(text).unwrap();
            assert_eq!(text, encoding.decode(&tokens).unwrap());
        }
    }

    #[test]
    fn plain_encoding_never_yields_special_tokens() {
        let encoding = test_encoding();

        let tokens = encoding.encode_plain("<|start|>user<|message|>hi<|end|>").unwrap();

        assert!(tokens.iter().all(|t| encoding.vocab().contains(*t)));
    }

    #[test]
    fn lazy_encoding_matches_eager() {
        let encoding = test_encoding();
        let text = "let params = crate::Encoding::load(12345);";

        let lazy = encoding
            .encode_plain_iter(text)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(encoding.encode_plain(text).unwrap(), lazy);
    }

    #[test]
    fn encode_recognizes_special_tokens() {
        let encoding = test_encoding();

        let tokens = encoding
            .encode_with_special_tokens("<|start|>user<|message|>hi<|end|>")
            .unwrap();

        assert_eq!(START, tokens[0]);
        assert_eq!(Some(&END), tokens.last());
        assert!(tokens.contains(&MESSAGE));
        assert_eq!(
            vec!["<|end|>"],
            encoding.find_special_tokens("a<|end|>b").collect::<Vec<_>>()
        );
    }

    #[test]
    fn prompt_structure() {
        let encoding = test_encoding();

        let tokens = encoding.render_prompt("be brief", "hi there", "ok").unwrap();

        let mut expected = vec![START];
        expected.extend(encoding.encode_plain("system").unwrap());
        expected.push(MESSAGE);
        expected.extend(encoding.encode_plain("be brief").unwrap());
        expected.push(END);
        expected.push(START);
        expected.extend(encoding.encode_plain("user").unwrap());
        expected.push(MESSAGE);
        expected.extend(encoding.encode_plain("hi there").unwrap());
        expected.push(END);
        expected.push(START);
        expected.extend(encoding.encode_plain("assistant").unwrap());
        expected.push(MESSAGE);
        expected.extend(encoding.encode_plain("ok").unwrap());
        assert_eq!(expected, tokens);

        assert_eq!(
            "<|start|>system<|message|>be brief<|end|><|start|>user<|message|>hi there<|end|><|start|>assistant<|message|>ok",
            encoding.decode(&tokens).unwrap()
        );
    }

    #[test]
    fn empty_segments_keep_delimiters() {
        let encoding = test_encoding();

        let tokens = encoding.render_prompt("", "", "").unwrap();

        assert_eq!(3, tokens.iter().filter(|t| **t == START).count());
        assert_eq!(3, tokens.iter().filter(|t| **t == MESSAGE).count());
        assert_eq!(2, tokens.iter().filter(|t| **t == END).count());
        assert_eq!(Some(&START), tokens.first());
        assert_eq!(Some(&MESSAGE), tokens.last());
    }

    #[test]
    fn decode_can_drop_special_tokens() {
        let encoding = test_encoding();
        let tokens = encoding.render_prompt("s", "u", "a").unwrap();

        let dropped = encoding
            .clone()
            .with_special_token_display(SpecialTokenDisplay::Drop);

        assert_eq!("systemsuseruassistanta", dropped.decode(&tokens).unwrap());
        assert_eq!(SpecialTokenDisplay::Render, encoding.special_token_display());
    }

    #[test]
    fn unknown_tokens() {
        let encoding = test_encoding();
        let mut tokens = encoding.encode_plain("ab").unwrap();
        tokens.push(150_000);

        assert_matches!(
            encoding.decode(&tokens),
            Err(HarmonyError::UnknownToken { token: 150_000 })
        );
        assert_eq!("ab\u{FFFD}", encoding.decode_lossy(&tokens));
        assert_matches!(
            encoding.classify(150_000),
            Err(HarmonyError::UnknownToken { .. })
        );
    }

    #[test]
    fn stop_tokens_are_special_and_classified() {
        let encoding = test_encoding();

        let stops = encoding.stop_tokens().unwrap();

        assert_eq!(BTreeSet::from([200_002, 200_007, 200_012]), stops);
        for stop in &stops {
            assert!(encoding.is_stop_token(*stop));
            assert!(!encoding.vocab().contains(*stop));
        }
        assert!(!encoding.is_stop_token(START));
        assert!(!encoding.is_stop_token(0));
        assert_eq!(
            TokenKind::Special(MESSAGE, SpecialTokenCategory::Structural),
            encoding.classify(MESSAGE).unwrap()
        );
    }

    #[test]
    fn special_ids_must_not_overlap_ordinary_ids() {
        let vocab = VocabularyTable::from_ranks([(b"a".to_vec(), 0), (b"b".to_vec(), 1)]).unwrap();
        let specials =
            SpecialTokenRegistry::new([SpecialToken::new("<|end|>", 1, SpecialTokenCategory::Stop)])
                .unwrap();

        let result = HarmonyEncoding::new("bad", vocab, specials, TextSegmenter::o200k().unwrap());

        assert_matches!(result, Err(HarmonyError::Misconfiguration { .. }));
    }

    #[test]
    fn unencodable_bytes_are_invalid_input() {
        let vocab = VocabularyTable::from_ranks([(b"a".to_vec(), 0)]).unwrap();
        let encoding = HarmonyEncoding::o200k_harmony(vocab).unwrap();

        assert_matches!(
            encoding.encode_plain("ab"),
            Err(HarmonyError::InvalidInput { .. })
        );
        assert_matches!(
            encoding.encode_plain_iter("a b").collect::<Result<Vec<_>>>(),
            Err(HarmonyError::InvalidInput { .. })
        );
    }

    #[test]
    fn impossible_reservations_are_allocation_failures() {
        let mut tokens = vec![1, 2, 3];

        assert_matches!(
            reserve_tokens(&mut tokens, usize::MAX),
            Err(HarmonyError::AllocationFailure { count: usize::MAX, .. })
        );
        assert_eq!(vec![1, 2, 3], tokens);
    }
}
