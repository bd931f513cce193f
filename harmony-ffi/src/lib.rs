//! C ABI over the harmony engine.
//!
//! Handles are opaque boxes.  Every string or token buffer returned here belongs to the caller
//! until it is passed back to the matching free function (`harmony_free_string`,
//! `harmony_free_tokens`); nothing handed out is referenced again by this library.  An empty token
//! buffer is returned as a NULL pointer with length 0.
//!
//! No entry point unwinds into the caller.  Panics are caught and reported like any other
//! failure.
use harmony::{HarmonyEncoding, HarmonyError, StreamableParser, Token, VocabularyTable};
use once_cell::sync::OnceCell;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::any::Any;
use std::ffi::{c_char, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::ptr;
use std::sync::{Mutex, PoisonError};
use tracing::*;

/// Environment variable naming the tiktoken vocabulary file used by [`harmony_encoding_new`]
pub const VOCAB_FILE_ENV: &str = "HARMONY_VOCAB_FILE";

#[derive(Debug, Snafu)]
enum FfiError {
    #[snafu(display("Argument `{name}` must not be NULL"))]
    NullArgument { name: &'static str },

    #[snafu(display("Argument `{name}` is not valid UTF-8"))]
    InvalidString {
        name: &'static str,
        source: std::str::Utf8Error,
    },

    #[snafu(display("Environment variable {} is not set", VOCAB_FILE_ENV))]
    VocabFileNotSet,

    #[snafu(display("Error reading vocabulary file {}", path.display()))]
    ReadVocab {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("{source}"))]
    Harmony { source: HarmonyError },

    #[snafu(display("Internal panic: {message}"))]
    Panic { message: String },
}

type Result<T, E = FfiError> = std::result::Result<T, E>;

pub struct HarmonyEncodingWrapper {
    encoding: HarmonyEncoding,
}

/// The header passes parsers as const pointers to `feed` and `flush`, so the mutable parser
/// lives behind a lock.
///
/// A parser only changes its state once a call has succeeded, so a lock poisoned by a panic
/// still guards a consistent parser and is simply taken over.
pub struct StreamableParserWrapper {
    parser: Mutex<StreamableParser>,
}

#[repr(C)]
pub struct HarmonyResult {
    pub success: bool,
    pub error_message: *mut c_char,
}

impl HarmonyResult {
    fn ok() -> Self {
        Self {
            success: true,
            error_message: ptr::null_mut(),
        }
    }

    fn err(error: &FfiError) -> Self {
        warn!(%error, "FFI call failed");
        Self {
            success: false,
            error_message: into_c_string(error.to_string()),
        }
    }
}

/// Hand a string to the caller.  Interior NULs would silently truncate it on the C side, so
/// they're replaced.
fn into_c_string(s: String) -> *mut c_char {
    let s = if s.contains('\0') {
        s.replace('\0', "\u{FFFD}")
    } else {
        s
    };
    CString::new(s).map_or(ptr::null_mut(), CString::into_raw)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `f`, turning a panic into an error
fn guard<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => PanicSnafu {
            message: panic_message(payload.as_ref()),
        }
        .fail(),
    }
}

/// Run `f` and report its tokens through the out-parameters.
///
/// On failure the out-parameters are left as NULL and 0.
unsafe fn token_result(
    tokens_out: *mut *mut u32,
    tokens_len: *mut usize,
    f: impl FnOnce() -> Result<Vec<Token>>,
) -> HarmonyResult {
    for (is_null, name) in [
        (tokens_out.is_null(), "tokens_out"),
        (tokens_len.is_null(), "tokens_len"),
    ] {
        if is_null {
            return HarmonyResult::err(&FfiError::NullArgument { name });
        }
    }
    *tokens_out = ptr::null_mut();
    *tokens_len = 0;

    match guard(f) {
        Ok(tokens) => {
            if !tokens.is_empty() {
                let tokens = tokens.into_boxed_slice();
                *tokens_len = tokens.len();
                *tokens_out = Box::into_raw(tokens) as *mut u32;
            }
            HarmonyResult::ok()
        }
        Err(e) => HarmonyResult::err(&e),
    }
}

unsafe fn encoding_ref<'a>(wrapper: *const HarmonyEncodingWrapper) -> Result<&'a HarmonyEncoding> {
    wrapper
        .as_ref()
        .map(|wrapper| &wrapper.encoding)
        .context(NullArgumentSnafu { name: "wrapper" })
}

unsafe fn parser_ref<'a>(
    parser: *const StreamableParserWrapper,
) -> Result<&'a Mutex<StreamableParser>> {
    parser
        .as_ref()
        .map(|wrapper| &wrapper.parser)
        .context(NullArgumentSnafu { name: "parser" })
}

unsafe fn str_arg<'a>(s: *const c_char, name: &'static str) -> Result<&'a str> {
    ensure!(!s.is_null(), NullArgumentSnafu { name });
    CStr::from_ptr(s).to_str().context(InvalidStringSnafu { name })
}

/// Like [`str_arg`] but NULL means the empty string
unsafe fn optional_str_arg<'a>(s: *const c_char, name: &'static str) -> Result<&'a str> {
    if s.is_null() {
        Ok("")
    } else {
        str_arg(s, name)
    }
}

/// A slice from a pointer and length.  NULL is allowed when the length is 0.
unsafe fn slice_arg<'a, T>(data: *const T, len: usize, name: &'static str) -> Result<&'a [T]> {
    if len == 0 {
        return Ok(&[]);
    }
    ensure!(!data.is_null(), NullArgumentSnafu { name });
    Ok(std::slice::from_raw_parts(data, len))
}

fn new_encoding_wrapper(encoding: HarmonyEncoding) -> *mut HarmonyEncodingWrapper {
    Box::into_raw(Box::new(HarmonyEncodingWrapper { encoding }))
}

/// The o200k_harmony encoding over the vocabulary named by [`VOCAB_FILE_ENV`], loaded once per
/// process.
fn default_encoding() -> Result<&'static HarmonyEncoding> {
    static ENCODING: OnceCell<HarmonyEncoding> = OnceCell::new();

    ENCODING.get_or_try_init(|| {
        let path = std::env::var_os(VOCAB_FILE_ENV)
            .map(PathBuf::from)
            .context(VocabFileNotSetSnafu)?;
        let data = std::fs::read(&path).context(ReadVocabSnafu { path: &path })?;
        let vocab = VocabularyTable::from_tiktoken(&data).context(HarmonySnafu)?;
        info!(path = %path.display(), tokens = vocab.len(), "Loaded vocabulary");

        HarmonyEncoding::o200k_harmony(vocab).context(HarmonySnafu)
    })
}

/// Release a string returned by this library.  NULL is ignored.
///
/// # Safety
///
/// `s` must be NULL or a string returned by this library that has not already been freed.
#[no_mangle]
pub unsafe extern "C" fn harmony_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// Release a token buffer returned by this library.  NULL is ignored.
///
/// # Safety
///
/// `tokens` and `len` must be exactly a pointer and length returned together by this library,
/// not already freed.
#[no_mangle]
pub unsafe extern "C" fn harmony_free_tokens(tokens: *mut u32, len: usize) {
    if !tokens.is_null() {
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(tokens, len)));
    }
}

/// Create the o200k_harmony encoding, reading the vocabulary from the file named by
/// `HARMONY_VOCAB_FILE`.  Returns NULL on failure; the reason is logged.
#[no_mangle]
pub extern "C" fn harmony_encoding_new() -> *mut HarmonyEncodingWrapper {
    match guard(|| default_encoding().cloned()) {
        Ok(encoding) => new_encoding_wrapper(encoding),
        Err(e) => {
            error!(error = %e, "Unable to create encoding");
            ptr::null_mut()
        }
    }
}

/// Create the o200k_harmony encoding from a vocabulary in tiktoken format held in memory.
/// Returns NULL on failure; the reason is logged.
///
/// # Safety
///
/// `data` must point to `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn harmony_encoding_new_from_tiktoken(
    data: *const u8,
    len: usize,
) -> *mut HarmonyEncodingWrapper {
    let result = guard(|| {
        let data = slice_arg(data, len, "data")?;
        let vocab = VocabularyTable::from_tiktoken(data).context(HarmonySnafu)?;
        HarmonyEncoding::o200k_harmony(vocab).context(HarmonySnafu)
    });

    match result {
        Ok(encoding) => new_encoding_wrapper(encoding),
        Err(e) => {
            error!(error = %e, "Unable to create encoding");
            ptr::null_mut()
        }
    }
}

/// # Safety
///
/// `wrapper` must be NULL or a handle from `harmony_encoding_new*` that has not been freed.
/// Parsers created from it stay valid.
#[no_mangle]
pub unsafe extern "C" fn harmony_encoding_free(wrapper: *mut HarmonyEncodingWrapper) {
    if !wrapper.is_null() {
        drop(Box::from_raw(wrapper));
    }
}

/// # Safety
///
/// `wrapper` must be a live encoding handle, `text` a NUL terminated string and both output
/// pointers writable.
#[no_mangle]
pub unsafe extern "C" fn harmony_encoding_encode_plain(
    wrapper: *const HarmonyEncodingWrapper,
    text: *const c_char,
    tokens_out: *mut *mut u32,
    tokens_len: *mut usize,
) -> HarmonyResult {
    token_result(tokens_out, tokens_len, || {
        let encoding = encoding_ref(wrapper)?;
        let text = str_arg(text, "text")?;
        encoding.encode_plain(text).context(HarmonySnafu)
    })
}

/// Render a system message, a user message and an open assistant message.  A NULL
/// `system_msg` or `assistant_prefix` is treated as empty.
///
/// # Safety
///
/// `wrapper` must be a live encoding handle, the message arguments NULL or NUL terminated strings
/// (`user_msg` must not be NULL) and both output pointers writable.
#[no_mangle]
pub unsafe extern "C" fn harmony_encoding_render_prompt(
    wrapper: *const HarmonyEncodingWrapper,
    system_msg: *const c_char,
    user_msg: *const c_char,
    assistant_prefix: *const c_char,
    tokens_out: *mut *mut u32,
    tokens_len: *mut usize,
) -> HarmonyResult {
    token_result(tokens_out, tokens_len, || {
        let encoding = encoding_ref(wrapper)?;
        let system = optional_str_arg(system_msg, "system_msg")?;
        let user = str_arg(user_msg, "user_msg")?;
        let assistant = optional_str_arg(assistant_prefix, "assistant_prefix")?;

        encoding
            .render_prompt(system, user, assistant)
            .context(HarmonySnafu)
    })
}

/// Decode tokens to text.  Unknown tokens and invalid UTF-8 decode to U+FFFD, so this only
/// returns NULL when given a NULL handle (or a NULL `tokens` with a non-zero length).
///
/// # Safety
///
/// `wrapper` must be a live encoding handle and `tokens` must point to `tokens_len` tokens.
#[no_mangle]
pub unsafe extern "C" fn harmony_encoding_decode(
    wrapper: *const HarmonyEncodingWrapper,
    tokens: *const u32,
    tokens_len: usize,
) -> *mut c_char {
    let result = guard(|| {
        let encoding = encoding_ref(wrapper)?;
        let tokens = slice_arg(tokens, tokens_len, "tokens")?;
        Ok(encoding.decode_lossy(tokens))
    });

    match result {
        Ok(text) => into_c_string(text),
        Err(e) => {
            error!(error = %e, "Unable to decode tokens");
            ptr::null_mut()
        }
    }
}

/// # Safety
///
/// `wrapper` must be a live encoding handle and both output pointers writable.
#[no_mangle]
pub unsafe extern "C" fn harmony_encoding_stop_tokens(
    wrapper: *const HarmonyEncodingWrapper,
    tokens_out: *mut *mut u32,
    tokens_len: *mut usize,
) -> HarmonyResult {
    token_result(tokens_out, tokens_len, || {
        let encoding = encoding_ref(wrapper)?;
        let stops = encoding.stop_tokens().context(HarmonySnafu)?;
        Ok(stops.into_iter().collect())
    })
}

/// Create a parser over `encoding`.  The parser holds its own reference to the encoding's
/// tables, so it may outlive the encoding handle.  Returns NULL if `encoding` is NULL.
///
/// # Safety
///
/// `encoding` must be NULL or a live encoding handle.
#[no_mangle]
pub unsafe extern "C" fn harmony_streamable_parser_new(
    encoding: *const HarmonyEncodingWrapper,
) -> *mut StreamableParserWrapper {
    match guard(|| encoding_ref(encoding).map(HarmonyEncoding::parser)) {
        Ok(parser) => Box::into_raw(Box::new(StreamableParserWrapper {
            parser: Mutex::new(parser),
        })),
        Err(e) => {
            error!(error = %e, "Unable to create parser");
            ptr::null_mut()
        }
    }
}

/// # Safety
///
/// `parser` must be NULL or a handle from `harmony_streamable_parser_new` that has not been
/// freed.
#[no_mangle]
pub unsafe extern "C" fn harmony_streamable_parser_free(parser: *mut StreamableParserWrapper) {
    if !parser.is_null() {
        drop(Box::from_raw(parser));
    }
}

/// Feed bytes to the parser and receive the tokens that became final.  Invalid UTF-8 fails and
/// leaves the parser as it was.
///
/// # Safety
///
/// `parser` must be a live parser handle, `data` must point to `data_len` readable bytes and both
/// output pointers writable.
#[no_mangle]
pub unsafe extern "C" fn harmony_streamable_parser_feed(
    parser: *const StreamableParserWrapper,
    data: *const u8,
    data_len: usize,
    tokens_out: *mut *mut u32,
    tokens_len: *mut usize,
) -> HarmonyResult {
    token_result(tokens_out, tokens_len, || {
        let parser = parser_ref(parser)?;
        let data = slice_arg(data, data_len, "data")?;
        let mut parser = parser.lock().unwrap_or_else(PoisonError::into_inner);
        parser.feed(data).context(HarmonySnafu)
    })
}

/// # Safety
///
/// `parser` must be NULL or a live parser handle.
#[no_mangle]
pub unsafe extern "C" fn harmony_streamable_parser_has_pending(
    parser: *const StreamableParserWrapper,
) -> bool {
    guard(|| {
        let parser = parser_ref(parser)?;
        let parser = parser.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(parser.has_pending())
    })
    .unwrap_or(false)
}

/// Encode everything the parser still holds.
///
/// # Safety
///
/// `parser` must be a live parser handle and both output pointers writable.
#[no_mangle]
pub unsafe extern "C" fn harmony_streamable_parser_flush(
    parser: *const StreamableParserWrapper,
    tokens_out: *mut *mut u32,
    tokens_len: *mut usize,
) -> HarmonyResult {
    token_result(tokens_out, tokens_len, || {
        let parser = parser_ref(parser)?;
        let mut parser = parser.lock().unwrap_or_else(PoisonError::into_inner);
        parser.flush().context(HarmonySnafu)
    })
}

/// Discard the parser's buffered input.
///
/// # Safety
///
/// `parser` must be NULL or a live parser handle.
#[no_mangle]
pub unsafe extern "C" fn harmony_streamable_parser_reset(parser: *mut StreamableParserWrapper) {
    let result = guard(|| {
        let parser = parser_ref(parser)?;
        parser.lock().unwrap_or_else(PoisonError::into_inner).reset();
        Ok(())
    });

    if let Err(e) = result {
        error!(error = %e, "Unable to reset parser");
    }
}
