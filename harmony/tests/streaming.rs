//! Feeding text to a parser in pieces must give the same tokens as encoding it whole.
use harmony::ParserState;
use proptest::prelude::*;
use proptest::sample::Index;

mod common;

/// Letters of both cases, digits, punctuation, contractions, whitespace runs and multi-byte
/// characters, which together exercise every branch of the segmentation pattern
const TEXT: &str = r"[a-zA-Z0-9 '!,.:\n\tÉé€🦀]{0,80}";

/// Split `bytes` at the given cut points, which may fall inside a UTF-8 sequence
fn pieces<'a>(bytes: &'a [u8], cuts: &[Index]) -> Vec<&'a [u8]> {
    let mut cuts = cuts
        .iter()
        .map(|cut| cut.index(bytes.len() + 1))
        .collect::<Vec<_>>();
    cuts.sort_unstable();

    let mut pieces = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for cut in cuts {
        pieces.push(&bytes[start..cut]);
        start = cut;
    }
    pieces.push(&bytes[start..]);
    pieces
}

proptest! {
    #[test]
    fn streaming_matches_whole_encoding(text in TEXT, cuts in prop::collection::vec(any::<Index>(), 0..8)) {
        let encoding = common::encoding();
        let expected = encoding.encode_plain(&text).unwrap();

        let mut parser = encoding.parser();
        let mut streamed = Vec::new();
        for piece in pieces(text.as_bytes(), &cuts) {
            streamed.extend(parser.feed(piece).unwrap());
        }
        streamed.extend(parser.flush().unwrap());

        prop_assert_eq!(&expected, &streamed);
        prop_assert_eq!(ParserState::Idle, parser.state());
        prop_assert_eq!(text.len(), parser.bytes_committed());
        prop_assert_eq!(expected.len(), parser.tokens_emitted());
    }

    #[test]
    fn byte_at_a_time(text in TEXT) {
        let encoding = common::encoding();

        let mut parser = encoding.parser();
        let mut streamed = Vec::new();
        for byte in text.bytes() {
            streamed.extend(parser.feed([byte]).unwrap());
        }
        streamed.extend(parser.flush().unwrap());

        prop_assert_eq!(encoding.encode_plain(&text).unwrap(), streamed);
    }

    #[test]
    fn reset_behaves_like_a_new_parser(
        before in TEXT,
        text in TEXT,
        cuts in prop::collection::vec(any::<Index>(), 0..4),
    ) {
        let encoding = common::encoding();
        let mut parser = encoding.parser();

        // Leave some state behind, possibly including half a character
        let before = before.as_bytes();
        parser.feed(&before[..before.len().saturating_sub(1)]).unwrap();
        parser.reset();
        parser.reset();
        prop_assert!(!parser.has_pending());

        let mut streamed = Vec::new();
        for piece in pieces(text.as_bytes(), &cuts) {
            streamed.extend(parser.feed(piece).unwrap());
        }
        streamed.extend(parser.flush().unwrap());

        prop_assert_eq!(encoding.encode_plain(&text).unwrap(), streamed);
    }

    #[test]
    fn plain_round_trip(text in "\\PC*") {
        let encoding = common::encoding();

        let tokens = encoding.encode_plain(&text).unwrap();

        prop_assert_eq!(&text, &encoding.decode(&tokens).unwrap());
        prop_assert!(tokens.iter().all(|token| encoding.vocab().contains(*token)));
    }
}
