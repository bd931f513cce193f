//! Parsing of the tiktoken vocabulary format (also called "mergeable ranks" in the tiktoken code).
//!
//! Each line is of the form `<base64 bytes> <rank>`.  Where the data comes from (a file on disk,
//! an embedded resource, a download cache) is the caller's business; this only parses bytes
//! already in memory.
use super::VocabularyTable;
use crate::error::{Base64Snafu, InvalidVocabularySnafu, VocabularyFormatSnafu};
use crate::{Rank, Result, TokenBytes};
use base64::{engine::general_purpose, Engine as _};
use snafu::{OptionExt, ResultExt};

/// Parse tiktoken formatted vocabulary data into `(bytes, rank)` pairs, in file order.
///
/// Blank lines are skipped.  Line numbers in errors are 1-based.
pub fn parse_tiktoken(data: &[u8]) -> Result<Vec<(TokenBytes, Rank)>> {
    let mut entries = Vec::new();

    for (index, line) in data.split(|&b| b == b'\n').enumerate() {
        let line_number = index + 1;
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        let space = line
            .iter()
            .rposition(|&b| b == b' ')
            .with_context(|| VocabularyFormatSnafu {
                line: line_number,
                reason: "missing the space between token and rank",
            })?;
        let (bytes, rank) = (&line[..space], &line[space + 1..]);

        let bytes = general_purpose::STANDARD
            .decode(bytes)
            .context(Base64Snafu { line: line_number })?;
        let rank = std::str::from_utf8(rank)
            .ok()
            .and_then(|rank| rank.trim().parse::<Rank>().ok())
            .with_context(|| VocabularyFormatSnafu {
                line: line_number,
                reason: format!("rank `{}` is not an integer", String::from_utf8_lossy(rank)),
            })?;

        entries.push((bytes, rank));
    }

    Ok(entries)
}

impl VocabularyTable {
    /// Build a vocabulary from tiktoken formatted data.
    ///
    /// Entries are ordered by rank before ids are assigned, and the ranks must be contiguous from
    /// zero, so every token id equals its rank just as it does in tiktoken.
    pub fn from_tiktoken(data: &[u8]) -> Result<Self> {
        let mut entries = parse_tiktoken(data)?;
        entries.sort_by_key(|(_, rank)| *rank);

        if let Some(position) = entries
            .iter()
            .enumerate()
            .position(|(index, (_, rank))| *rank as usize != index)
        {
            return InvalidVocabularySnafu {
                reason: format!(
                    "ranks are not contiguous: expected rank {position}, found {}",
                    entries[position].1
                ),
            }
            .fail();
        }

        Self::from_ranks(entries)
    }
}
