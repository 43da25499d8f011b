//! Boundary to the external ML runtime.
//!
//! Tokenization, model execution and weight loading live behind the traits
//! in this module. [`crate::backend`] provides a concrete implementation; the
//! session layer only ever talks to these traits.

pub mod detokenizer;
pub mod template;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::interrupt::StoppingCriteria;
use crate::{ChatError, ChatTurn};

// ── Load configuration ────────────────────────────────────────────────────────

/// Numeric precision of the weights to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// 4-bit weights with fp16 activations.
    Q4f16,
    Q4,
    Q8,
    F16,
    F32,
}

/// Execution device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceKind {
    /// Best available accelerator, falling back to CPU.
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
    WebGpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Auto => write!(f, "auto"),
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            DeviceKind::Metal(ordinal) => write!(f, "metal:{ordinal}"),
            DeviceKind::WebGpu => write!(f, "webgpu"),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    /// Accepts `auto`, `cpu`, `webgpu`, `cuda`, `cuda:N`, `metal`, `metal:N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let (name, ordinal) = match lower.split_once(':') {
            Some((name, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| format!("invalid device ordinal in '{s}'"))?;
                (name, ordinal)
            }
            None => (lower.as_str(), 0),
        };
        match name {
            "auto" => Ok(DeviceKind::Auto),
            "cpu" => Ok(DeviceKind::Cpu),
            "cuda" | "gpu" => Ok(DeviceKind::Cuda(ordinal)),
            "metal" => Ok(DeviceKind::Metal(ordinal)),
            "webgpu" => Ok(DeviceKind::WebGpu),
            _ => Err(format!("unknown device '{s}'")),
        }
    }
}

/// Load progress reported while the tokenizer and model are resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadProgress {
    /// Resolution of a file started.
    Initiate { file: String },
    /// Bytes received for a file being downloaded.
    Download {
        file: String,
        loaded: usize,
        total: usize,
    },
    /// A file is available locally.
    Done { file: String },
    /// Tokenizer and model are built and usable.
    Ready { model_id: String },
}

impl LoadProgress {
    /// Download completion in `[0, 1]`, when known.
    pub fn fraction(&self) -> Option<f64> {
        match self {
            LoadProgress::Download { loaded, total, .. } if *total > 0 => {
                Some((*loaded as f64 / *total as f64).clamp(0.0, 1.0))
            }
            LoadProgress::Done { .. } | LoadProgress::Ready { .. } => Some(1.0),
            _ => None,
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(LoadProgress) + Send + Sync>;

/// What to load and how.
#[derive(Clone)]
pub struct LoadConfig {
    /// Repository holding the weight file.
    pub model_id: String,
    /// Repository holding `tokenizer.json` / `tokenizer_config.json`.
    pub tokenizer_id: String,
    /// Weight file name inside `model_id`; derived from `dtype` when `None`.
    pub weights_file: Option<String>,
    pub revision: String,
    pub dtype: Dtype,
    pub device: DeviceKind,
    /// Weights come from a separate data file rather than the model definition.
    pub use_external_data_format: bool,
    pub progress: Option<ProgressCallback>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            model_id: "microsoft/Phi-3-mini-4k-instruct-gguf".to_owned(),
            tokenizer_id: "microsoft/Phi-3-mini-4k-instruct".to_owned(),
            weights_file: None,
            revision: "main".to_owned(),
            dtype: Dtype::Q4,
            device: DeviceKind::Auto,
            use_external_data_format: true,
            progress: None,
        }
    }
}

impl fmt::Debug for LoadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadConfig")
            .field("model_id", &self.model_id)
            .field("tokenizer_id", &self.tokenizer_id)
            .field("weights_file", &self.weights_file)
            .field("revision", &self.revision)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .field("use_external_data_format", &self.use_external_data_format)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl LoadConfig {
    pub fn report(&self, event: LoadProgress) {
        if let Some(progress) = &self.progress {
            progress(event);
        }
    }
}

// ── Tokenizer boundary ────────────────────────────────────────────────────────

/// Model-ready encoding of a rendered conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedInput {
    /// Rendered prompt text, kept for diagnostics.
    pub prompt: String,
    pub input_ids: Vec<u32>,
}

pub trait ChatTokenizer: Send + Sync {
    /// Render `turns` through the chat template and encode the result.
    ///
    /// With `add_generation_prompt` the encoding ends with the assistant
    /// header so the model continues as the assistant.
    fn apply_chat_template(
        &self,
        turns: &[ChatTurn],
        add_generation_prompt: bool,
    ) -> Result<EncodedInput, ChatError>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, ChatError>;
}

// ── Model boundary ────────────────────────────────────────────────────────────

/// Sampling knobs forwarded to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    /// `None` or `<= 0` selects greedy decoding.
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub seed: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 1024,
            temperature: None,
            top_p: None,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            seed: 299_792_458,
        }
    }
}

/// A freshly sampled token and its text increment.
///
/// `text` may be empty when the token completes no printable character yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedToken {
    pub id: u32,
    pub text: String,
}

/// Receives tokens synchronously from inside the generation loop.
pub trait TokenSink: Send {
    fn on_token(&mut self, token: &GeneratedToken);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    EndOfSequence,
    MaxNewTokens,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    /// Newly generated ids only; the prompt is not included.
    pub tokens: Vec<u32>,
    pub stop_reason: StopReason,
}

pub trait CausalLanguageModel: Send {
    /// Generate a continuation of `input`.
    ///
    /// Implementations must consult [`StoppingCriteria::stop_reason`] before
    /// every sampling step and return what was produced so far with the
    /// reason it gives once it fires.
    fn generate(
        &mut self,
        input: &EncodedInput,
        params: &GenerationParams,
        stopping: &dyn StoppingCriteria,
        sink: &mut dyn TokenSink,
    ) -> Result<GenerationOutput, ChatError>;
}

// ── Loader ────────────────────────────────────────────────────────────────────

/// A tokenizer paired with the model it was trained for.
pub struct LoadedModel {
    pub tokenizer: Arc<dyn ChatTokenizer>,
    /// Locked for the whole duration of one generation.
    pub model: Arc<Mutex<Box<dyn CausalLanguageModel>>>,
}

impl LoadedModel {
    pub fn new(tokenizer: Arc<dyn ChatTokenizer>, model: Box<dyn CausalLanguageModel>) -> Self {
        Self {
            tokenizer,
            model: Arc::new(Mutex::new(model)),
        }
    }
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, config: &LoadConfig) -> Result<LoadedModel, ChatError>;
}
