use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use harmony::{
    HarmonyEncoding, SpecialTokenDisplay, SpecialTokenRegistry, TextSegmenter, Token,
    VocabularyTable,
};
use serde::Serialize;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::exit;
use tracing::*;
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    globals: Globals,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Globals {
    /// Vocabulary file in tiktoken format (one `<base64 bytes> <rank>` entry per line)
    #[arg(long, value_name = "FILE", global = true, env = "HARMONY_VOCAB_FILE")]
    vocab: Option<PathBuf>,

    /// Word boundary pattern used to split text before byte pair encoding
    #[arg(long, value_enum, default_value_t = Pattern::O200k, global = true)]
    pattern: Pattern,

    /// Write results as JSON instead of plain text
    #[arg(long, global = true)]
    json: bool,

    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    debug: u8,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Pattern {
    O200k,
    Cl100k,
}

impl Globals {
    fn load_encoding(&self) -> anyhow::Result<HarmonyEncoding> {
        let path = self
            .vocab
            .as_deref()
            .context("No vocabulary file given; use --vocab or set HARMONY_VOCAB_FILE")?;
        let vocab = load_vocab(path)?;

        let encoding = match self.pattern {
            Pattern::O200k => HarmonyEncoding::o200k_harmony(vocab)?,
            Pattern::Cl100k => HarmonyEncoding::new(
                "cl100k_harmony",
                vocab,
                SpecialTokenRegistry::o200k_harmony()?,
                TextSegmenter::cl100k()?,
            )?,
        };
        debug!(?encoding, "Loaded encoding");

        Ok(encoding)
    }

    /// Write `value` as JSON, or as text with `text` if JSON wasn't asked for
    fn emit<T: Serialize>(
        &self,
        out: &mut impl Write,
        value: &T,
        text: impl FnOnce(&mut dyn Write) -> std::io::Result<()>,
    ) -> anyhow::Result<()> {
        if self.json {
            serde_json::to_writer(&mut *out, value)?;
            writeln!(out)?;
        } else {
            text(out)?;
        }
        Ok(())
    }
}

fn load_vocab(path: &Path) -> anyhow::Result<VocabularyTable> {
    let data = std::fs::read(path)
        .with_context(|| format!("Error reading vocabulary file {}", path.display()))?;
    let vocab = VocabularyTable::from_tiktoken(&data)
        .with_context(|| format!("Error loading vocabulary file {}", path.display()))?;

    info!(path = %path.display(), tokens = vocab.len(), "Loaded vocabulary");
    Ok(vocab)
}

#[derive(Subcommand)]
enum Commands {
    /// Encode text to tokens
    Encode {
        /// The text to encode.  Read from stdin if not given
        text: Option<String>,

        /// Encode the literal text of special tokens (eg `<|start|>`) as those tokens
        #[arg(long)]
        special: bool,
    },

    /// Decode tokens to text
    Decode {
        #[arg(required = true)]
        tokens: Vec<Token>,

        /// Leave special tokens out of the text instead of rendering them
        #[arg(long)]
        drop_special: bool,
    },

    /// Render a system message, a user message and the start of an assistant reply to tokens
    Render {
        #[arg(long, default_value = "")]
        system: String,

        #[arg(long)]
        user: String,

        /// Text the assistant's reply starts with
        #[arg(long, default_value = "")]
        assistant: String,
    },

    /// List the tokens that end a message or generation
    StopTokens,

    /// Show how text is split into chunks before byte pair encoding
    Segment {
        /// The text to split.  Read from stdin if not given
        text: Option<String>,
    },

    /// Encode a file (or stdin) incrementally, printing tokens as they become final
    Stream {
        file: Option<PathBuf>,

        /// Bytes read per step
        #[arg(long, default_value_t = 16)]
        chunk_size: usize,
    },
}

#[derive(Serialize)]
struct SpecialTokenEntry<'a> {
    id: Token,
    name: &'a str,
}

#[derive(Serialize)]
struct StreamBatch {
    tokens: Vec<Token>,
    pending: usize,
    flushed: bool,
}

impl Commands {
    fn execute(self, globals: &Globals, out: &mut impl Write) -> anyhow::Result<()> {
        use Commands::*;

        let encoding = globals.load_encoding()?;

        match self {
            Encode { text, special } => {
                let text = text_or_stdin(text)?;
                let tokens = if special {
                    encoding.encode_with_special_tokens(&text)?
                } else {
                    encoding.encode_plain(&text)?
                };
                globals.emit(out, &tokens, |out| write_tokens(out, &tokens))?;
            }
            Decode {
                tokens,
                drop_special,
            } => {
                let display = if drop_special {
                    SpecialTokenDisplay::Drop
                } else {
                    SpecialTokenDisplay::Render
                };
                let text = encoding
                    .with_special_token_display(display)
                    .decode(&tokens)?;
                globals.emit(out, &text, |out| writeln!(out, "{text}"))?;
            }
            Render {
                system,
                user,
                assistant,
            } => {
                let tokens = encoding.render_prompt(&system, &user, &assistant)?;
                globals.emit(out, &tokens, |out| write_tokens(out, &tokens))?;
            }
            StopTokens => {
                let stops = encoding.stop_tokens()?;
                let entries = stops
                    .iter()
                    .filter_map(|id| encoding.special_tokens().get(*id))
                    .map(|token| SpecialTokenEntry {
                        id: token.id,
                        name: &token.name,
                    })
                    .collect::<Vec<_>>();
                globals.emit(out, &entries, |out| {
                    for entry in &entries {
                        writeln!(out, "{}\t{}", entry.id, entry.name)?;
                    }
                    Ok(())
                })?;
            }
            Segment { text } => {
                let text = text_or_stdin(text)?;
                let chunks = encoding
                    .segmenter()
                    .segment(&text)
                    .collect::<harmony::Result<Vec<_>>>()?;
                globals.emit(out, &chunks, |out| {
                    for chunk in &chunks {
                        writeln!(out, "{chunk:?}")?;
                    }
                    Ok(())
                })?;
            }
            Stream { file, chunk_size } => {
                anyhow::ensure!(chunk_size > 0, "--chunk-size must be at least 1");

                let mut input: Box<dyn Read> = match &file {
                    Some(path) => Box::new(
                        std::fs::File::open(path)
                            .with_context(|| format!("Error opening {}", path.display()))?,
                    ),
                    None => Box::new(std::io::stdin().lock()),
                };

                let mut parser = encoding.parser();
                let mut buf = vec![0u8; chunk_size];
                loop {
                    let read = input.read(&mut buf).context("Error reading input")?;
                    if read == 0 {
                        break;
                    }
                    let tokens = parser.feed(&buf[..read])?;
                    if !tokens.is_empty() {
                        let batch = StreamBatch {
                            tokens,
                            pending: parser.pending_len(),
                            flushed: false,
                        };
                        globals.emit(out, &batch, |out| write_tokens(out, &batch.tokens))?;
                    }
                }

                let batch = StreamBatch {
                    tokens: parser.flush()?,
                    pending: 0,
                    flushed: true,
                };
                if !batch.tokens.is_empty() {
                    globals.emit(out, &batch, |out| write_tokens(out, &batch.tokens))?;
                }
                debug!(
                    bytes = parser.bytes_committed(),
                    tokens = parser.tokens_emitted(),
                    "Stream complete"
                );
            }
        }

        Ok(())
    }
}

fn text_or_stdin(text: Option<String>) -> anyhow::Result<String> {
    match text {
        Some(text) => Ok(text),
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("Error reading text from stdin")?;
            Ok(text)
        }
    }
}

fn write_tokens(out: &mut dyn Write, tokens: &[Token]) -> std::io::Result<()> {
    let line = tokens
        .iter()
        .map(Token::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    writeln!(out, "{line}")
}

fn main() {
    let cli = Cli::parse();
    // You can see how many times a particular flag or argument occurred
    // Note, only flags can have multiple occurrences
    let default_log_directive = match cli.globals.debug {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Initialize tracing with JSON formatting and full detail
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_directive.into())
                .from_env_lossy(),
        )
        .json()
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    let stdout = std::io::stdout();
    if let Err(e) = cli.command.execute(&cli.globals, &mut stdout.lock()) {
        error!("{:#}", e);
        exit(1);
    } else {
        debug!("command executed successfully");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose, Engine as _};
    use tempfile::NamedTempFile;

    /// Verify that there aren't any invalid attributes in the CLI specification that can only be
    /// detected at runtime
    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    /// A vocabulary file with every byte plus a few words
    fn vocab_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let words = ["hello", " world"].map(|word| word.as_bytes().to_vec());
        let entries = (0..=255u8).map(|byte| vec![byte]).chain(words);
        for (rank, bytes) in entries.enumerate() {
            writeln!(file, "{} {rank}", general_purpose::STANDARD.encode(bytes)).unwrap();
        }
        file
    }

    fn run(vocab: &NamedTempFile, args: &[&str]) -> anyhow::Result<String> {
        let path = vocab.path().to_str().unwrap();
        let cli = Cli::try_parse_from(["hmy", "--vocab", path].iter().chain(args))?;

        let mut out = Vec::new();
        cli.command.execute(&cli.globals, &mut out)?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn encode_and_decode() {
        let vocab = vocab_file();

        assert_eq!("256 257\n", run(&vocab, &["encode", "hello world"]).unwrap());
        assert_eq!("[256,257]\n", run(&vocab, &["--json", "encode", "hello world"]).unwrap());
        assert_eq!(
            "hello world\n",
            run(&vocab, &["decode", "256", "257"]).unwrap()
        );
    }

    #[test]
    fn special_tokens_in_text() {
        let vocab = vocab_file();

        assert_eq!(
            "200006 256 200007\n",
            run(&vocab, &["encode", "--special", "<|start|>hello<|end|>"]).unwrap()
        );
        assert_eq!(
            "hello\n",
            run(&vocab, &["decode", "--drop-special", "200006", "256", "200007"]).unwrap()
        );
    }

    #[test]
    fn render_and_stop_tokens() {
        let vocab = vocab_file();

        let rendered = run(&vocab, &["render", "--user", "hello"]).unwrap();
        assert!(rendered.starts_with("200006 "));
        assert!(rendered.trim_end().ends_with("200008"));

        assert_eq!(
            "200002\t<|return|>\n200007\t<|end|>\n200012\t<|call|>\n",
            run(&vocab, &["stop-tokens"]).unwrap()
        );
    }

    #[test]
    fn segment_and_stream() {
        let vocab = vocab_file();

        assert_eq!(
            "\"hello\"\n\" world\"\n",
            run(&vocab, &["segment", "hello world"]).unwrap()
        );

        let mut input = NamedTempFile::new().unwrap();
        write!(input, "hello world hello world").unwrap();
        let output = run(
            &vocab,
            &["stream", input.path().to_str().unwrap(), "--chunk-size", "5"],
        )
        .unwrap();
        let tokens = |output: String| {
            output
                .split_whitespace()
                .map(|token| token.parse::<Token>().unwrap())
                .collect::<Vec<_>>()
        };

        let expected = run(&vocab, &["encode", "hello world hello world"]).unwrap();
        assert_eq!(tokens(expected), tokens(output));
    }

    #[test]
    fn missing_vocabulary_is_an_error() {
        let cli = Cli::try_parse_from(["hmy", "stop-tokens"]).unwrap();
        // Ignore any vocabulary the environment supplies
        let globals = Globals {
            vocab: None,
            ..cli.globals
        };
        let mut out = Vec::new();

        let error = cli.command.execute(&globals, &mut out).unwrap_err();

        assert!(error.to_string().contains("--vocab"), "{error:#}");
        assert!(out.is_empty());
    }
}
