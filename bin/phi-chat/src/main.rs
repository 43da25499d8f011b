//! phi-chat – entry point.
//!
//! Startup order:
//! 1. Read configuration from environment variables, then apply CLI flags.
//! 2. Initialise structured tracing (JSON or human-readable).
//! 3. Open the conversation store and restore the previous conversation.
//! 4. Load tokenizer and model.
//! 5. Answer the single prompt, or run the interactive loop.

mod cli;
mod config;
mod repl;

use std::sync::Arc;

use clap::Parser;
use phi_chat_core::backend::candle::CandleLoader;
use phi_chat_core::provider::ModelProvider;
use phi_chat_core::runtime::LoadProgress;
use phi_chat_core::{ChatSession, ConversationStore, FileStore, LoadStatus};
use tracing::{debug, info};

use crate::cli::Cli;
use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cli = Cli::parse();
    let mut cfg = Config::from_env();
    cli.apply(&mut cfg);

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "phi-chat starting");

    // ── 3. Conversation store ──────────────────────────────────────────────────
    let kv = FileStore::new(&cfg.data_dir)?;
    let (store, status) = ConversationStore::load(Box::new(kv), cfg.history_key.clone())?;
    if let LoadStatus::Discarded { reason } = &status {
        eprintln!("[stored conversation was unreadable and has been set aside: {reason}]");
    }

    // ── 4. Model ───────────────────────────────────────────────────────────────
    let loader = match &cfg.cache_dir {
        Some(dir) => CandleLoader::with_cache_dir(dir),
        None => CandleLoader::new(),
    };
    let mut load_config = cfg.load_config();
    load_config.progress = Some(Arc::new(report_progress));
    let provider = Arc::new(ModelProvider::new(Arc::new(loader), load_config));

    let session = ChatSession::new(provider, store, cfg.generation_options());
    eprintln!("[loading {} …]", cfg.model_id);
    session.load_model().await?;

    // ── 5. Chat ────────────────────────────────────────────────────────────────
    let system = cli.system.as_deref();
    match cli.prompt.as_deref() {
        Some(prompt) => {
            let turns = repl::turns_for(&session, system, prompt)?;
            repl::ask(&session, turns).await?;
        }
        None => repl::run(&session, system).await?,
    }

    info!("phi-chat stopped");
    Ok(())
}

fn init_tracing(cfg: &Config) {
    // Build the log-level filter, warning loudly if the configured value is
    // not a valid tracing filter expression.
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: PHI_CHAT_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    // Logs go to stderr so streamed answers on stdout stay clean.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn report_progress(event: LoadProgress) {
    match &event {
        LoadProgress::Download { file, .. } => {
            debug!(file = %file, fraction = event.fraction().unwrap_or_default(), "downloading");
        }
        LoadProgress::Initiate { file } => info!(file = %file, "resolving"),
        LoadProgress::Done { file } => info!(file = %file, "available"),
        LoadProgress::Ready { model_id } => info!(model_id = %model_id, "model ready"),
    }
}
