//! Splitting text into pre-token chunks before byte pair encoding.
//!
//! BPE never merges across a chunk boundary, so the segmentation regex fixes where tokens can
//! begin and end.  Chunks are produced lazily and the segmenter holds no state between calls.
use crate::error::{InvalidPatternSnafu, SegmentationSnafu};
use crate::Result;
use snafu::ResultExt;
use std::ops::Range;

/// The word boundary regex of the o200k family of encodings, including o200k_harmony.
pub const O200K_PATTERN: &str = concat!(
    r"[^\r\n\p{L}\p{N}]?[\p{Lu}\p{Lt}\p{Lm}\p{Lo}\p{M}]*[\p{Ll}\p{Lm}\p{Lo}\p{M}]+(?i:'s|'t|'re|'ve|'m|'ll|'d)?",
    "|",
    r"[^\r\n\p{L}\p{N}]?[\p{Lu}\p{Lt}\p{Lm}\p{Lo}\p{M}]+[\p{Ll}\p{Lm}\p{Lo}\p{M}]*(?i:'s|'t|'re|'ve|'m|'ll|'d)?",
    "|",
    r"\p{N}{1,3}",
    "|",
    r" ?[^\s\p{L}\p{N}]+[\r\n/]*",
    "|",
    r"\s*[\r\n]+",
    "|",
    r"\s+(?!\S)",
    "|",
    r"\s+",
);

/// The word boundary regex of cl100k_base.
pub const CL100K_PATTERN: &str = r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

/// How many trailing chunks of a buffer may still change when more text is appended.
///
/// With the patterns above, whether a chunk ends where it does is decided by looking at no more
/// than the chunk after it (greedy runs read one character past their end, `\s+(?!\S)` peeks
/// one character, a contraction suffix is at most three characters and those belong to the next
/// chunk).  So the last chunk can grow, and the one before it can change, but nothing earlier.
pub const UNSTABLE_TAIL_CHUNKS: usize = 2;

/// Splits text into the chunks BPE is applied to.
///
/// Regrettably, the word separator regexes used by these encodings use "fancy" features (the
/// `(?!\S)` lookahead) that are not available in the regular rust `regex` crate.  So the slower
/// 'fancy' impl is needed.
#[derive(Clone, Debug)]
pub struct TextSegmenter {
    regex: fancy_regex::Regex,
}

impl TextSegmenter {
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            regex: fancy_regex::Regex::new(pattern).context(InvalidPatternSnafu)?,
        })
    }

    pub fn o200k() -> Result<Self> {
        Self::new(O200K_PATTERN)
    }

    pub fn cl100k() -> Result<Self> {
        Self::new(CL100K_PATTERN)
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    /// Lazily split `text` into chunks.
    ///
    /// The chunks are contiguous and cover all of `text`: any text the pattern doesn't match is
    /// yielded as a chunk of its own.
    pub fn segment<'a>(&'a self, text: &'a str) -> Segments<'a> {
        Segments {
            spans: self.spans(text),
        }
    }

    /// Like [`Self::segment`] but yields byte ranges into `text`
    pub fn spans<'a>(&'a self, text: &'a str) -> Spans<'a> {
        Spans {
            regex: &self.regex,
            text,
            pos: 0,
            next_match: None,
        }
    }
}

/// Iterator over the byte ranges of the chunks of a text.
///
/// See [`TextSegmenter::spans`]
pub struct Spans<'a> {
    regex: &'a fancy_regex::Regex,
    text: &'a str,

    /// The offset into `text` where the next chunk starts
    pos: usize,

    /// A match found past a gap, yielded after the gap itself
    next_match: Option<Range<usize>>,
}

impl<'a> Spans<'a> {
    fn advance(&mut self, span: Range<usize>) -> Option<Result<Range<usize>>> {
        self.pos = span.end;
        Some(Ok(span))
    }
}

impl<'a> Iterator for Spans<'a> {
    type Item = Result<Range<usize>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(span) = self.next_match.take() {
            return self.advance(span);
        }
        if self.pos >= self.text.len() {
            return None;
        }

        let found = match self.regex.find_from_pos(self.text, self.pos) {
            Ok(found) => found,
            Err(source) => {
                // Don't retry the same position forever
                let offset = self.pos;
                self.pos = self.text.len();
                return Some(Err(source).context(SegmentationSnafu { offset }));
            }
        };

        let span = match found.map(|m| m.start()..m.end()) {
            Some(m) if m.start == self.pos && m.end > m.start => m,
            Some(m) if m.end > m.start => {
                // Unmatched text before the match becomes its own chunk
                let gap = self.pos..m.start;
                self.next_match = Some(m);
                gap
            }
            Some(m) if m.start > self.pos => self.pos..m.start,
            // An empty match at `pos`.  Take one character so the iterator always makes progress
            Some(_) => self.pos..next_char_boundary(self.text, self.pos),
            None => self.pos..self.text.len(),
        };
        self.advance(span)
    }
}

/// Iterator over the chunks of a text.
///
/// See [`TextSegmenter::segment`]
pub struct Segments<'a> {
    spans: Spans<'a>,
}

impl<'a> Iterator for Segments<'a> {
    type Item = Result<&'a str>;

    fn next(&mut self) -> Option<Self::Item> {
        let text = self.spans.text;
        self.spans
            .next()
            .map(|span| span.map(|span| &text[span]))
    }
}

fn next_char_boundary(text: &str, pos: usize) -> usize {
    text[pos..]
        .chars()
        .next()
        .map_or(text.len(), |c| pos + c.len_utf8())
}
