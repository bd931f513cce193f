//! Incremental encoding of text that arrives in pieces.
//!
//! The parser buffers input until it is sure the tokens for a prefix can no longer change, and
//! emits exactly those tokens.  Concatenating everything returned by [`StreamableParser::feed`]
//! and [`StreamableParser::flush`] gives the same tokens as encoding the whole text at once, no
//! matter where the input was cut, including in the middle of a UTF-8 sequence.
use crate::encoding::reserve_tokens;
use crate::error::InvalidInputSnafu;
use crate::segment::UNSTABLE_TAIL_CHUNKS;
use crate::{bpe, HarmonyEncoding, Result, Token};
use std::ops::Range;
use tracing::*;

/// Held-back input shorter than this is segmented again on every feed.  Past it, segmenting
/// waits until the input has grown by half since the last attempt, so a single chunk that keeps
/// growing costs linear rather than quadratic work.
const EAGER_RESCAN_LIMIT: usize = 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum ParserState {
    /// Nothing is buffered
    Idle,

    /// Some input is held back, waiting for more text or a flush
    Accumulating,
}

/// Streaming encoder over a [`HarmonyEncoding`].
///
/// A parser owns its buffer and is driven by one caller at a time.  Parsers over the same
/// encoding share its tables and are otherwise independent.
#[derive(Debug)]
pub struct StreamableParser {
    encoding: HarmonyEncoding,

    /// Bytes received but not yet encoded.  Valid UTF-8 except possibly an incomplete sequence at
    /// the very end.
    pending: Vec<u8>,

    /// Length of the prefix of `pending` made of complete characters
    complete_len: usize,

    /// Length of `pending` right after it was last segmented
    scanned_len: usize,

    /// Total bytes whose tokens have been emitted
    bytes_committed: usize,

    /// Total tokens emitted since creation or the last reset
    tokens_emitted: usize,

    /// Total bytes run through the segmenter since creation or the last reset
    bytes_segmented: usize,
}

impl StreamableParser {
    pub fn new(encoding: HarmonyEncoding) -> Self {
        Self {
            encoding,
            pending: Vec::new(),
            complete_len: 0,
            scanned_len: 0,
            bytes_committed: 0,
            tokens_emitted: 0,
            bytes_segmented: 0,
        }
    }

    pub fn encoding(&self) -> &HarmonyEncoding {
        &self.encoding
    }

    /// Append `chunk` to the stream and return the tokens that became final.
    ///
    /// The last [`UNSTABLE_TAIL_CHUNKS`] segments, and any incomplete UTF-8 sequence at the end,
    /// are held back because more input could still change how they encode.  Once the held-back
    /// input is long, it is only segmented again after it has grown by half, so tokens for a long
    /// run can be returned by a later call than the one that made them final.
    ///
    /// Fails with `InvalidInput` if the stream is not valid UTF-8.  On failure the parser is left
    /// exactly as it was before the call.
    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) -> Result<Vec<Token>> {
        let chunk = chunk.as_ref();
        let appended_at = self.pending.len();
        let complete_len = self.complete_len;
        self.pending.extend_from_slice(chunk);

        let result = self.encode_stable_prefix(chunk.len());
        if result.is_err() {
            self.pending.truncate(appended_at);
            self.complete_len = complete_len;
        }
        result
    }

    /// Everything after the first fallible step of `feed`.  State other than `pending` and
    /// `complete_len` is only touched once nothing can fail.
    fn encode_stable_prefix(&mut self, fed: usize) -> Result<Vec<Token>> {
        // Only the bytes after the last complete character need checking
        let (checked, _incomplete) = split_utf8(
            &self.pending[self.complete_len..],
            self.bytes_committed + self.complete_len,
        )?;
        self.complete_len += checked.len();

        if self.scanned_len >= EAGER_RESCAN_LIMIT
            && self.pending.len() < self.scanned_len + self.scanned_len / 2
        {
            trace!(fed, pending = self.pending.len(), "Deferred segmenting a long tail");
            return Ok(Vec::new());
        }

        let (text, _) = split_utf8(&self.pending[..self.complete_len], self.bytes_committed)?;
        let spans = self
            .encoding
            .segmenter()
            .spans(text)
            .collect::<Result<Vec<Range<usize>>>>()?;

        let stable = spans.len().saturating_sub(UNSTABLE_TAIL_CHUNKS);
        let committed = spans[..stable].last().map_or(0, |span| span.end);

        // The stable spans are encoded as they are.  Segmenting the committed prefix again on its
        // own could split its last chunk differently.
        let mut tokens = Vec::new();
        reserve_tokens(&mut tokens, self.encoding.estimate_num_tokens(&text[..committed]))?;
        for span in &spans[..stable] {
            bpe::encode_chunk(text[span.clone()].as_bytes(), self.encoding.vocab(), &mut tokens)?;
        }
        let segmented = text.len();

        self.pending.drain(..committed);
        self.complete_len -= committed;
        self.scanned_len = self.pending.len();
        self.bytes_committed += committed;
        self.tokens_emitted += tokens.len();
        self.bytes_segmented += segmented;

        trace!(
            fed,
            committed,
            pending = self.pending.len(),
            tokens = tokens.len(),
            "Fed parser"
        );
        Ok(tokens)
    }

    /// Encode everything still buffered and return its tokens, leaving the parser idle.
    ///
    /// Fails with `InvalidInput` if the stream ends inside a UTF-8 sequence; the buffered bytes are
    /// kept so the caller can still feed the rest of the sequence.
    pub fn flush(&mut self) -> Result<Vec<Token>> {
        let (text, incomplete) = split_utf8(&self.pending, self.bytes_committed)?;
        if !incomplete.is_empty() {
            return InvalidInputSnafu {
                offset: self.bytes_committed + text.len(),
                reason: format!(
                    "stream ends inside a UTF-8 sequence ({} bytes)",
                    incomplete.len()
                ),
            }
            .fail();
        }

        let tokens = self.encoding.encode_plain(text)?;

        self.bytes_committed += self.pending.len();
        self.bytes_segmented += self.pending.len();
        self.tokens_emitted += tokens.len();
        self.pending.clear();
        self.complete_len = 0;
        self.scanned_len = 0;

        debug!(
            tokens = tokens.len(),
            bytes_committed = self.bytes_committed,
            tokens_emitted = self.tokens_emitted,
            bytes_segmented = self.bytes_segmented,
            "Flushed parser"
        );
        Ok(tokens)
    }

    /// Discard any buffered input and the running totals.  The parser behaves as if newly
    /// created.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.complete_len = 0;
        self.scanned_len = 0;
        self.bytes_committed = 0;
        self.tokens_emitted = 0;
        self.bytes_segmented = 0;
    }

    pub fn state(&self) -> ParserState {
        if self.pending.is_empty() {
            ParserState::Idle
        } else {
            ParserState::Accumulating
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Number of bytes held back
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn bytes_committed(&self) -> usize {
        self.bytes_committed
    }

    pub fn tokens_emitted(&self) -> usize {
        self.tokens_emitted
    }
}

/// Split `buf` into its longest valid UTF-8 prefix and an incomplete trailing sequence.
///
/// Invalid UTF-8 anywhere other than a truncated final sequence is an error.  `base` is the
/// stream offset of `buf[0]`, for error reporting.
fn split_utf8(buf: &[u8], base: usize) -> Result<(&str, &[u8])> {
    match std::str::from_utf8(buf) {
        Ok(text) => Ok((text, &buf[buf.len()..])),
        Err(e) if e.error_len().is_none() => {
            let (valid, incomplete) = buf.split_at(e.valid_up_to());
            let text = std::str::from_utf8(valid).map_err(|e| {
                InvalidInputSnafu {
                    offset: base + e.valid_up_to(),
                    reason: "invalid UTF-8 sequence",
                }
                .build()
            })?;
            Ok((text, incomplete))
        }
        Err(e) => InvalidInputSnafu {
            offset: base + e.valid_up_to(),
            reason: "invalid UTF-8 sequence",
        }
        .fail(),
    }
}
