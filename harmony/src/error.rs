use crate::Token;
use snafu::Snafu;
use std::collections::TryReserveError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HarmonyError {
    #[snafu(display("Invalid input at byte offset {offset}: {reason}"))]
    InvalidInput { offset: usize, reason: String },

    #[snafu(display("Token {token} has no entry in the vocabulary or special token registry"))]
    UnknownToken { token: Token },

    #[snafu(display("Unable to allocate an output buffer for {count} tokens"))]
    AllocationFailure {
        count: usize,
        source: TryReserveError,
    },

    #[snafu(display("Encoding is misconfigured: {reason}"))]
    Misconfiguration { reason: String },

    #[snafu(display("Invalid vocabulary: {reason}"))]
    InvalidVocabulary { reason: String },

    #[snafu(display("Invalid vocabulary data on line {line}: {reason}"))]
    VocabularyFormat { line: usize, reason: String },

    #[snafu(display("Invalid base64 token on vocabulary line {line}"))]
    Base64 {
        line: usize,
        source: base64::DecodeError,
    },

    #[snafu(display("Invalid text segmentation pattern"))]
    InvalidPattern { source: fancy_regex::Error },

    #[snafu(display("Text segmentation failed at byte offset {offset}"))]
    Segmentation {
        offset: usize,
        source: fancy_regex::Error,
    },
}

/// The coarse failure categories callers act on.
///
/// Several [`HarmonyError`] variants exist to carry a useful message; they all fold onto one of
/// these four kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum ErrorKind {
    InvalidInput,
    UnknownToken,
    AllocationFailure,
    Misconfiguration,
}

impl HarmonyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarmonyError::InvalidInput { .. } | HarmonyError::Segmentation { .. } => {
                ErrorKind::InvalidInput
            }
            HarmonyError::UnknownToken { .. } => ErrorKind::UnknownToken,
            HarmonyError::AllocationFailure { .. } => ErrorKind::AllocationFailure,
            HarmonyError::Misconfiguration { .. }
            | HarmonyError::InvalidVocabulary { .. }
            | HarmonyError::VocabularyFormat { .. }
            | HarmonyError::Base64 { .. }
            | HarmonyError::InvalidPattern { .. } => ErrorKind::Misconfiguration,
        }
    }
}
