//! Implementation of byte pair encoding as it relates to encoding text as tokens, and the inverse
//! mapping from tokens back to bytes.
use crate::encoding::reserve_tokens;
use crate::error::{InvalidInputSnafu, UnknownTokenSnafu};
use crate::{Rank, Result, Token, VocabularyTable};
use snafu::OptionExt;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Encode one pre-token chunk.
///
/// In a ranked vocabulary a chunk that is itself a token is done; otherwise it is broken up into
/// subword tokens with [`byte_pair_encode`].  The tokens are appended to `out`, which grows
/// fallibly.  Scratch space for the merge itself is allocated normally.
pub fn encode_chunk(chunk: &[u8], vocab: &VocabularyTable, out: &mut Vec<Token>) -> Result<()> {
    match vocab.whole_chunk_token(chunk) {
        Some(token) => {
            reserve_tokens(out, 1)?;
            out.push(token);
        }
        None => {
            let tokens = byte_pair_encode(chunk, vocab)?;
            reserve_tokens(out, tokens.len())?;
            out.extend(tokens);
        }
    }
    Ok(())
}

/// Using the BPE algorithm find the tokens in a chunk and return their integer form.
///
/// Fails with `InvalidInput` if a byte of the chunk has no single byte token to start from.
pub fn byte_pair_encode(chunk: &[u8], vocab: &VocabularyTable) -> Result<Vec<Token>> {
    if chunk.len() == 1 {
        return Ok(vec![initial_token(chunk[0], 0, vocab)?]);
    }

    byte_pair_merge(chunk, vocab)
}

/// Using the BPE algorithm, find the tokens in a chunk and return their byte string form.
pub fn byte_pair_split<'a>(chunk: &'a [u8], vocab: &VocabularyTable) -> Result<Vec<&'a [u8]>> {
    let tokens = byte_pair_encode(chunk, vocab)?;

    let mut pieces = Vec::with_capacity(tokens.len());
    let mut start = 0;
    for token in tokens {
        let len = vocab
            .token_len(token)
            .context(UnknownTokenSnafu { token })?;
        pieces.push(&chunk[start..start + len]);
        start += len;
    }
    Ok(pieces)
}

/// Concatenate the bytes of ordinary tokens.  There is no merge logic in this direction.
pub fn decode_bytes(tokens: &[Token], vocab: &VocabularyTable) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(tokens.len() * 4);
    for &token in tokens {
        bytes.extend_from_slice(vocab.lookup_bytes(token)?);
    }
    Ok(bytes)
}

fn initial_token(byte: u8, offset: usize, vocab: &VocabularyTable) -> Result<Token> {
    vocab.byte_token(byte).with_context(|| InvalidInputSnafu {
        offset,
        reason: format!("byte {byte:#04x} has no token in the vocabulary"),
    })
}

/// Marks the end of the node list in either direction
const NONE: usize = usize::MAX;

/// One surviving token in the chunk being merged, linked to its neighbours.
///
/// Nodes never move once created, so a node's index also says where it sits relative to the
/// other surviving nodes.  That is what makes heap ties break towards the leftmost pair.
struct Node {
    token: Token,

    /// Rank of merging this node with `next`, if that pair merges at all
    rank: Option<Rank>,
    prev: usize,
    next: usize,
}

/// Merge the bytes of a chunk together into progressively fewer, longer tokens.
///
/// Starts from one token per byte and repeatedly fuses the adjacent pair with the lowest merge
/// rank, leftmost first among equal ranks, until no adjacent pair has a rank.  A merge can create
/// a new adjacency that outranks pairs left unmerged earlier, so this is a global reduction, not
/// a single left-to-right pass.
///
/// Candidate pairs live in a min-heap keyed by `(rank, node index)`.  Merging only changes the
/// pairs on either side of the merged node, and entries whose rank no longer matches their node
/// are stale and skipped when popped, so the whole thing is O(n log n).
fn byte_pair_merge(chunk: &[u8], vocab: &VocabularyTable) -> Result<Vec<Token>> {
    let n = chunk.len();
    let mut nodes = Vec::with_capacity(n);
    for (i, &byte) in chunk.iter().enumerate() {
        nodes.push(Node {
            token: initial_token(byte, i, vocab)?,
            rank: None,
            prev: if i == 0 { NONE } else { i - 1 },
            next: if i + 1 < n { i + 1 } else { NONE },
        });
    }

    let mut heap = BinaryHeap::with_capacity(n);
    for i in 0..n.saturating_sub(1) {
        nodes[i].rank = pair_rank(&nodes, i, vocab);
        if let Some(rank) = nodes[i].rank {
            heap.push(Reverse((rank, i)));
        }
    }

    while let Some(Reverse((rank, i))) = heap.pop() {
        if nodes[i].rank != Some(rank) {
            continue;
        }

        let j = nodes[i].next;
        let merged = match vocab.merge(nodes[i].token, nodes[j].token) {
            Some(merge) => merge.token,
            None => continue,
        };
        nodes[i].token = merged;

        // Unlink j
        let after = nodes[j].next;
        nodes[i].next = after;
        if after != NONE {
            nodes[after].prev = i;
        }
        nodes[j].rank = None;

        // Only the pairs on either side of the merged node changed
        nodes[i].rank = pair_rank(&nodes, i, vocab);
        if let Some(rank) = nodes[i].rank {
            heap.push(Reverse((rank, i)));
        }
        let before = nodes[i].prev;
        if before != NONE {
            nodes[before].rank = pair_rank(&nodes, before, vocab);
            if let Some(rank) = nodes[before].rank {
                heap.push(Reverse((rank, before)));
            }
        }
    }

    let mut out = Vec::with_capacity(n);
    let mut cur = 0;
    while cur != NONE {
        out.push(nodes[cur].token);
        cur = nodes[cur].next;
    }
    Ok(out)
}

#[inline]
fn pair_rank(nodes: &[Node], i: usize, vocab: &VocabularyTable) -> Option<Rank> {
    let j = nodes[i].next;
    if j == NONE {
        return None;
    }
    vocab.rank(nodes[i].token, nodes[j].token)
}
