use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use recall_chat::{
    CANCELLATION_NOTICE, ChatError, ChatSurface, ContextDraft, SettingsError, SettingsStore,
};
use recall_llm::{CancellationToken, Reference, ScriptedBackend, StreamHandler, StreamOutcome};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: recall [--collection ID]... [--capture ID]... [--bookmarks] \
[--no-brain] [--replay FILE] [--set KEY=VALUE]... [prompt]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CliArgs {
    collections: Vec<String>,
    captures: Vec<String>,
    bookmarks: bool,
    no_brain: bool,
    replay: Option<PathBuf>,
    settings: Vec<(String, String)>,
    prompt: String,
}

impl CliArgs {
    fn draft(&self) -> ContextDraft {
        let mut draft = ContextDraft::new();
        if self.no_brain {
            draft.toggle_brain();
        }
        // Enabling bookmarks drops picked sets, so it goes first.
        if self.bookmarks {
            draft.toggle_bookmarks();
        }
        for collection in &self.collections {
            draft.toggle_collection(collection);
        }
        for capture in &self.captures {
            draft.toggle_capture(capture);
        }
        draft
    }
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("{USAGE}"))]
    Usage { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("expected KEY=VALUE for '--set', got '{raw}'"))]
    InvalidSetting { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("failed to read replay file {path:?}: {source}"))]
    ReadReplay {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("{source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("{source}"))]
    Chat {
        stage: &'static str,
        source: ChatError,
    },
}

type CliResult<T> = Result<T, CliError>;

/// Prints streamed text as it arrives.
#[derive(Default)]
struct TerminalPrinter {
    references: Vec<Reference>,
}

impl StreamHandler for TerminalPrinter {
    fn on_text(&mut self, text: String) {
        let mut stdout = std::io::stdout().lock();
        if let Err(error) = stdout.write_all(text.as_bytes()).and_then(|()| stdout.flush()) {
            tracing::warn!(error = %error, "failed to write streamed text to stdout");
        }
    }

    fn on_references(&mut self, references: Vec<Reference>) {
        self.references = references;
    }

    fn on_done(&mut self) {
        println!();
        for (index, reference) in self.references.iter().enumerate() {
            println!("[{}] {} <{}>", index + 1, reference.title, reference.url);
        }
    }

    fn on_error(&mut self, message: String) {
        eprintln!("\nerror: {message}");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(Some(StreamOutcome::Failed)) => std::process::exit(1),
        Ok(_) => {}
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(2);
        }
    }
}

async fn run() -> CliResult<Option<StreamOutcome>> {
    let args = parse_args(env::args().skip(1))?;
    let store = SettingsStore::load();
    if !args.settings.is_empty() {
        let mut updated = store.settings().as_ref().clone();
        for (key, value) in &args.settings {
            updated.set(key, value).context(SettingsSnafu {
                stage: "apply-setting",
            })?;
        }
        store.update(updated).context(SettingsSnafu {
            stage: "save-settings",
        })?;
        eprintln!("settings saved to {}", store.config_path().display());
        if args.prompt.trim().is_empty() {
            return Ok(None);
        }
    }
    let settings = store.settings();

    let surface = match args.replay.as_deref() {
        Some(path) => {
            let body = std::fs::read(path).context(ReadReplaySnafu {
                stage: "read-replay-file",
                path: path.to_path_buf(),
            })?;
            ChatSurface::new(Arc::new(ScriptedBackend::new([body]))).with_settings(&settings)
        }
        None => ChatSurface::from_settings(&settings).context(ChatSnafu {
            stage: "create-chat-surface",
        })?,
    };

    let mut draft = args.draft();
    let transcript = surface
        .start_conversation(&mut draft, &args.prompt)
        .context(ChatSnafu {
            stage: "start-conversation",
        })?;
    let turn = transcript
        .append_user(&args.prompt, &CancellationToken::new())
        .context(ChatSnafu {
            stage: "append-user-message",
        })?;

    let interrupt = {
        let transcript = transcript.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                transcript.cancel();
            }
        })
    };

    tracing::debug!(
        conversation_id = %transcript.id(),
        session_id = %turn.session_id(),
        message_count = turn.request().messages.len(),
        "streaming answer"
    );
    let mut printer = TerminalPrinter::default();
    let outcome = transcript.stream_observed(turn, &mut printer).await;
    interrupt.abort();

    if outcome == StreamOutcome::Cancelled {
        println!("\n{CANCELLATION_NOTICE}");
    }
    tracing::debug!(
        conversation_id = %transcript.id(),
        ?outcome,
        message_count = transcript.messages().len(),
        "conversation turn finished"
    );
    Ok(Some(outcome))
}

fn parse_args(args: impl IntoIterator<Item = String>) -> CliResult<CliArgs> {
    let mut parsed = CliArgs::default();
    let mut prompt = Vec::new();
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--collection" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-collection-value",
                    arg: "--collection",
                })?;
                parsed.collections.push(value);
            }
            "--capture" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-capture-value",
                    arg: "--capture",
                })?;
                parsed.captures.push(value);
            }
            "--replay" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-replay-value",
                    arg: "--replay",
                })?;
                parsed.replay = Some(PathBuf::from(value));
            }
            "--set" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-set-value",
                    arg: "--set",
                })?;
                let (key, setting) = value.split_once('=').context(InvalidSettingSnafu {
                    stage: "parse-args-set-pair",
                    raw: value.clone(),
                })?;
                parsed
                    .settings
                    .push((key.trim().to_string(), setting.to_string()));
            }
            "--bookmarks" => parsed.bookmarks = true,
            "--no-brain" => parsed.no_brain = true,
            "-h" | "--help" => {
                return UsageSnafu {
                    stage: "parse-args-help",
                }
                .fail();
            }
            raw if raw.starts_with("--") => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
            _ => prompt.push(argument),
        }
    }

    parsed.prompt = prompt.join(" ");
    // Saving settings is a complete run on its own.
    if parsed.prompt.trim().is_empty() && parsed.settings.is_empty() {
        return UsageSnafu {
            stage: "parse-args-prompt-required",
        }
        .fail();
    }
    Ok(parsed)
}
