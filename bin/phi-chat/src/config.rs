//! Chat configuration, loaded from environment variables at startup.

use std::path::PathBuf;

use phi_chat_core::GenerationOptions;
use phi_chat_core::runtime::{DeviceKind, Dtype, GenerationParams, LoadConfig};
use phi_chat_core::storage::conversation::DEFAULT_HISTORY_KEY;

/// Runtime configuration for phi-chat.
///
/// Every field has a default so the binary runs without any environment
/// variables set. Command-line flags override what is read here.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hub repository holding the GGUF weights.
    pub model_id: String,

    /// Hub repository holding `tokenizer.json` and `tokenizer_config.json`.
    pub tokenizer_id: String,

    /// Explicit weight file; derived from `dtype` when unset.
    pub weights_file: Option<String>,

    pub revision: String,
    pub dtype: Dtype,
    pub device: DeviceKind,

    /// hf-hub cache root; the hub default when unset.
    pub cache_dir: Option<PathBuf>,

    /// Directory holding the persisted conversation.
    pub data_dir: PathBuf,

    /// Slot name of the persisted conversation (default: `"chat_memory"`).
    pub history_key: String,

    pub max_new_tokens: usize,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub seed: u64,

    /// Keep the partial answer of an interrupted generation.
    pub persist_interrupted: bool,

    /// `tracing` filter string, e.g. `"info"` or `"debug,hf_hub=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let load = LoadConfig::default();
        let params = GenerationParams::default();
        Self {
            model_id: env_or(&lookup, "PHI_CHAT_MODEL_ID", &load.model_id),
            tokenizer_id: env_or(&lookup, "PHI_CHAT_TOKENIZER_ID", &load.tokenizer_id),
            weights_file: lookup("PHI_CHAT_WEIGHTS_FILE"),
            revision: env_or(&lookup, "PHI_CHAT_REVISION", &load.revision),
            dtype: parse_env(&lookup, "PHI_CHAT_DTYPE", load.dtype),
            device: parse_env(&lookup, "PHI_CHAT_DEVICE", load.device),
            cache_dir: lookup("PHI_CHAT_CACHE_DIR").map(PathBuf::from),
            data_dir: PathBuf::from(env_or(&lookup, "PHI_CHAT_DATA_DIR", "./data")),
            history_key: env_or(&lookup, "PHI_CHAT_HISTORY_KEY", DEFAULT_HISTORY_KEY),
            max_new_tokens: parse_env(&lookup, "PHI_CHAT_MAX_NEW_TOKENS", params.max_new_tokens),
            temperature: lookup("PHI_CHAT_TEMPERATURE").and_then(|v| v.parse().ok()),
            top_p: lookup("PHI_CHAT_TOP_P").and_then(|v| v.parse().ok()),
            seed: parse_env(&lookup, "PHI_CHAT_SEED", params.seed),
            persist_interrupted: flag(&lookup, "PHI_CHAT_PERSIST_INTERRUPTED"),
            log_level: env_or(&lookup, "PHI_CHAT_LOG", "info"),
            log_json: flag(&lookup, "PHI_CHAT_LOG_JSON"),
        }
    }

    pub fn load_config(&self) -> LoadConfig {
        LoadConfig {
            model_id: self.model_id.clone(),
            tokenizer_id: self.tokenizer_id.clone(),
            weights_file: self.weights_file.clone(),
            revision: self.revision.clone(),
            dtype: self.dtype,
            device: self.device,
            ..LoadConfig::default()
        }
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            params: GenerationParams {
                max_new_tokens: self.max_new_tokens,
                temperature: self.temperature,
                top_p: self.top_p,
                seed: self.seed,
                ..GenerationParams::default()
            },
            persist_interrupted: self.persist_interrupted,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
