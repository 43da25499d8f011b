//! Quantized Phi-3 on candle, weights and tokenizer resolved through hf-hub.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_phi3::ModelWeights;
use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Cache, Repo, RepoType};
use tracing::{debug, info, warn};

use crate::interrupt::StoppingCriteria;
use crate::runtime::detokenizer::IncrementalDecoder;
use crate::runtime::template::ChatTemplate;
use crate::runtime::{
    CausalLanguageModel, ChatTokenizer, DeviceKind, Dtype, EncodedInput, GeneratedToken,
    GenerationOutput, GenerationParams, LoadConfig, LoadProgress, LoadedModel, ModelLoader,
    StopReason, TokenSink,
};
use crate::{ChatError, ChatTurn};

const TOKENIZER_FILE: &str = "tokenizer.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// Phi-3 ends a turn with `<|end|>` and a document with `<|endoftext|>`.
const PHI3_STOP_TOKENS: &[&str] = &["<|end|>", "<|endoftext|>"];

/// Context window assumed when the GGUF metadata does not state one.
const FALLBACK_CONTEXT_LENGTH: usize = 4096;

// ── Loader ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CandleLoader {
    cache_dir: Option<PathBuf>,
}

impl CandleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `dir` as the hf-hub cache root instead of the default one.
    pub fn with_cache_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: Some(dir.into()),
        }
    }
}

#[async_trait]
impl ModelLoader for CandleLoader {
    async fn load(&self, config: &LoadConfig) -> Result<LoadedModel, ChatError> {
        check_supported(config)?;
        let weights_file = weights_file_name(config)?;

        let loader = self.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || loader.load_blocking(&config, &weights_file))
            .await
            .map_err(|source| ChatError::WorkerPanicked { source })?
    }
}

impl CandleLoader {
    fn load_blocking(
        &self,
        config: &LoadConfig,
        weights_file: &str,
    ) -> Result<LoadedModel, ChatError> {
        let hub = Hub::new(self.cache_dir.clone(), config)?;
        let load_err = |e: anyhow::Error| ChatError::load(&config.model_id, e);

        let tokenizer_repo = hub.repo(&config.tokenizer_id);
        let tokenizer_path = hub.fetch(&tokenizer_repo, TOKENIZER_FILE)?;
        let template = match hub.fetch(&tokenizer_repo, TOKENIZER_CONFIG_FILE) {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| load_err(e.into()))?;
                ChatTemplate::from_tokenizer_config(&raw)?
            }
            Err(e) => {
                warn!(repo = %config.tokenizer_id, error = %e, "no tokenizer config; using built-in template");
                None
            }
        }
        .unwrap_or_else(ChatTemplate::phi3);
        let tokenizer = Arc::new(CandleTokenizer::from_file(&tokenizer_path, template)?);

        let weights_path = hub.fetch(&hub.repo(&config.model_id), weights_file)?;
        let device = select_device(config.device)?;
        info!(path = %weights_path.display(), device = ?device, "reading GGUF weights");

        let mut file = File::open(&weights_path).map_err(|e| load_err(e.into()))?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| load_err(anyhow::Error::new(e).context("invalid GGUF file")))?;
        let context_length = content
            .metadata
            .get("phi3.context_length")
            .and_then(|v| v.to_u32().ok())
            .map(|n| n as usize)
            .unwrap_or(FALLBACK_CONTEXT_LENGTH);
        let weights = ModelWeights::from_gguf(false, content, &mut file, &device)
            .map_err(|e| load_err(e.into()))?;

        let eos_ids = tokenizer.stop_token_ids();
        debug!(?eos_ids, context_length, "phi-3 model built");

        let model = CandlePhi3 {
            weights,
            device,
            tokenizer: tokenizer.clone(),
            eos_ids,
            context_length,
        };
        Ok(LoadedModel::new(tokenizer, Box::new(model)))
    }
}

/// Rejects configurations candle cannot serve before anything is fetched.
fn check_supported(config: &LoadConfig) -> Result<(), ChatError> {
    if config.device == DeviceKind::WebGpu {
        return Err(ChatError::unsupported("candle has no WebGPU device"));
    }
    if !config.use_external_data_format {
        return Err(ChatError::unsupported(
            "candle reads weights from a separate GGUF file only",
        ));
    }
    Ok(())
}

/// `microsoft/Phi-3-mini-4k-instruct-gguf` + `q4` →
/// `Phi-3-mini-4k-instruct-q4.gguf`.
fn weights_file_name(config: &LoadConfig) -> Result<String, ChatError> {
    if let Some(file) = &config.weights_file {
        return Ok(file.clone());
    }
    let suffix = match config.dtype {
        Dtype::Q4 | Dtype::Q4f16 => "q4",
        Dtype::F16 => "fp16",
        other => {
            return Err(ChatError::unsupported(format!(
                "no default weight file for dtype {other}; set weights_file"
            )));
        }
    };
    let repo_name = config
        .model_id
        .rsplit('/')
        .next()
        .unwrap_or(&config.model_id);
    let stem = repo_name
        .strip_suffix("-gguf")
        .or_else(|| repo_name.strip_suffix("-GGUF"))
        .unwrap_or(repo_name);
    Ok(format!("{stem}-{suffix}.gguf"))
}

fn select_device(kind: DeviceKind) -> Result<Device, ChatError> {
    let device = match kind {
        DeviceKind::Cpu => Ok(Device::Cpu),
        DeviceKind::Cuda(ordinal) => Device::new_cuda(ordinal),
        DeviceKind::Metal(ordinal) => Device::new_metal(ordinal),
        DeviceKind::WebGpu => return Err(ChatError::unsupported("candle has no WebGPU device")),
        DeviceKind::Auto if candle_core::utils::cuda_is_available() => Device::new_cuda(0),
        DeviceKind::Auto if candle_core::utils::metal_is_available() => Device::new_metal(0),
        DeviceKind::Auto => Ok(Device::Cpu),
    };
    device.map_err(|e| ChatError::unsupported(format!("device {kind} unavailable: {e}")))
}

// ── Hub access ────────────────────────────────────────────────────────────────

struct Hub<'a> {
    api: Api,
    cache: Cache,
    config: &'a LoadConfig,
}

impl<'a> Hub<'a> {
    fn new(cache_dir: Option<PathBuf>, config: &'a LoadConfig) -> Result<Self, ChatError> {
        let cache = cache_dir.map(Cache::new).unwrap_or_default();
        let api = ApiBuilder::from_cache(cache.clone())
            .with_progress(false)
            .build()
            .map_err(|e| ChatError::load(&config.model_id, e))?;
        Ok(Self { api, cache, config })
    }

    fn repo(&self, id: &str) -> Repo {
        Repo::with_revision(id.to_owned(), RepoType::Model, self.config.revision.clone())
    }

    /// Cache first; downloads report byte progress.
    fn fetch(&self, repo: &Repo, file: &str) -> Result<PathBuf, ChatError> {
        self.config.report(LoadProgress::Initiate {
            file: file.to_owned(),
        });
        let path = match self.cache.repo(repo.clone()).get(file) {
            Some(path) => {
                debug!(file, "cache hit");
                path
            }
            None => {
                info!(file, "downloading");
                let progress = HubProgress {
                    config: self.config.clone(),
                    file: file.to_owned(),
                    loaded: 0,
                    total: 0,
                };
                self.api
                    .repo(repo.clone())
                    .download_with_progress(file, progress)
                    .map_err(|e| {
                        ChatError::load(
                            &self.config.model_id,
                            anyhow::Error::new(e).context(format!("failed to fetch {file}")),
                        )
                    })?
            }
        };
        self.config.report(LoadProgress::Done {
            file: file.to_owned(),
        });
        Ok(path)
    }
}

#[derive(Clone)]
struct HubProgress {
    config: LoadConfig,
    file: String,
    loaded: usize,
    total: usize,
}

impl HubProgress {
    fn report(&self) {
        self.config.report(LoadProgress::Download {
            file: self.file.clone(),
            loaded: self.loaded,
            total: self.total,
        });
    }
}

impl hf_hub::api::Progress for HubProgress {
    fn init(&mut self, size: usize, _filename: &str) {
        self.total = size;
        self.loaded = 0;
        self.report();
    }

    fn update(&mut self, size: usize) {
        self.loaded += size;
        self.report();
    }

    fn finish(&mut self) {}
}

// ── Tokenizer ─────────────────────────────────────────────────────────────────

pub struct CandleTokenizer {
    inner: tokenizers::Tokenizer,
    template: ChatTemplate,
}

impl CandleTokenizer {
    pub fn new(inner: tokenizers::Tokenizer, template: ChatTemplate) -> Self {
        Self { inner, template }
    }

    pub fn from_file(path: &std::path::Path, template: ChatTemplate) -> Result<Self, ChatError> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| ChatError::tokenizer(anyhow::anyhow!(e)))?;
        Ok(Self::new(inner, template))
    }

    /// Ids that end an assistant turn: the template's EOS plus the Phi-3
    /// end markers the vocabulary knows.
    pub fn stop_token_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = std::iter::once(self.template.eos_token())
            .chain(PHI3_STOP_TOKENS.iter().copied())
            .filter_map(|token| self.inner.token_to_id(token))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

impl ChatTokenizer for CandleTokenizer {
    fn apply_chat_template(
        &self,
        turns: &[ChatTurn],
        add_generation_prompt: bool,
    ) -> Result<EncodedInput, ChatError> {
        let prompt = self.template.render(turns, add_generation_prompt)?;
        // The template already emits BOS and turn markers.
        let encoding = self
            .inner
            .encode(prompt.as_str(), false)
            .map_err(|e| ChatError::tokenizer(anyhow::anyhow!(e)))?;
        Ok(EncodedInput {
            prompt,
            input_ids: encoding.get_ids().to_vec(),
        })
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, ChatError> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| ChatError::tokenizer(anyhow::anyhow!(e)))
    }
}

// ── Model ─────────────────────────────────────────────────────────────────────

pub struct CandlePhi3 {
    weights: ModelWeights,
    device: Device,
    tokenizer: Arc<CandleTokenizer>,
    eos_ids: Vec<u32>,
    context_length: usize,
}

fn sampling(params: &GenerationParams) -> Sampling {
    match params.temperature {
        Some(temperature) if temperature > 0.0 => match params.top_p {
            Some(p) => Sampling::TopP { p, temperature },
            None => Sampling::All { temperature },
        },
        _ => Sampling::ArgMax,
    }
}

/// Decides, before each sampling step, whether generation is over.
///
/// An end-of-sequence token wins, then the caller's criteria (interrupt,
/// token budget), then a full context window.
fn stop_check(
    generated: &[u32],
    eos_ids: &[u32],
    total_len: usize,
    context_length: usize,
    stopping: &dyn StoppingCriteria,
) -> Option<StopReason> {
    if generated.last().is_some_and(|id| eos_ids.contains(id)) {
        return Some(StopReason::EndOfSequence);
    }
    if let Some(reason) = stopping.stop_reason(generated) {
        return Some(reason);
    }
    (total_len >= context_length).then_some(StopReason::MaxNewTokens)
}

impl CandlePhi3 {
    fn next_logits(
        &mut self,
        input: &[u32],
        pos: usize,
        history: &[u32],
        params: &GenerationParams,
    ) -> candle_core::Result<Tensor> {
        let input = Tensor::new(input, &self.device)?.unsqueeze(0)?;
        let logits = self
            .weights
            .forward(&input, pos)?
            .squeeze(0)?
            .to_dtype(DType::F32)?;
        if params.repeat_penalty == 1.0 {
            return Ok(logits);
        }
        let start_at = history.len().saturating_sub(params.repeat_last_n);
        candle_transformers::utils::apply_repeat_penalty(
            &logits,
            params.repeat_penalty,
            &history[start_at..],
        )
    }
}

impl CausalLanguageModel for CandlePhi3 {
    fn generate(
        &mut self,
        input: &EncodedInput,
        params: &GenerationParams,
        stopping: &dyn StoppingCriteria,
        sink: &mut dyn TokenSink,
    ) -> Result<GenerationOutput, ChatError> {
        let prompt_len = input.input_ids.len();
        if prompt_len == 0 {
            return Err(ChatError::generation(anyhow::anyhow!("empty prompt")));
        }
        if prompt_len >= self.context_length {
            return Err(ChatError::generation(anyhow::anyhow!(
                "prompt of {prompt_len} tokens exceeds the {} token context window",
                self.context_length
            )));
        }

        let mut logits_processor = LogitsProcessor::from_sampling(params.seed, sampling(params));
        let mut decoder = IncrementalDecoder::new();
        let mut all_tokens = input.input_ids.clone();
        let mut generated = Vec::new();
        let mut pending = input.input_ids.clone();
        let mut pos = 0;

        let stop_reason = loop {
            if let Some(reason) = stop_check(
                &generated,
                &self.eos_ids,
                all_tokens.len(),
                self.context_length,
                stopping,
            ) {
                break reason;
            }

            let logits = self
                .next_logits(&pending, pos, &all_tokens, params)
                .map_err(ChatError::generation)?;
            pos += pending.len();
            let next = logits_processor
                .sample(&logits)
                .map_err(ChatError::generation)?;

            all_tokens.push(next);
            generated.push(next);
            let text = decoder.next_token(self.tokenizer.as_ref(), next)?;
            sink.on_token(&GeneratedToken { id: next, text });
            pending = vec![next];
        };

        debug!(prompt_len, generated = generated.len(), %stop_reason, "phi-3 generation done");
        Ok(GenerationOutput {
            tokens: generated,
            stop_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::{InterruptHandle, MaxNewTokens, StoppingCriteriaList};

    fn config(dtype: Dtype) -> LoadConfig {
        LoadConfig {
            dtype,
            ..LoadConfig::default()
        }
    }

    #[test]
    fn weight_file_follows_dtype() {
        assert_eq!(
            weights_file_name(&config(Dtype::Q4)).unwrap(),
            "Phi-3-mini-4k-instruct-q4.gguf"
        );
        assert_eq!(
            weights_file_name(&config(Dtype::F16)).unwrap(),
            "Phi-3-mini-4k-instruct-fp16.gguf"
        );
        assert!(matches!(
            weights_file_name(&config(Dtype::F32)),
            Err(ChatError::Unsupported { .. })
        ));
    }

    #[test]
    fn explicit_weight_file_wins() {
        let config = LoadConfig {
            weights_file: Some("custom.gguf".into()),
            dtype: Dtype::Q8,
            ..LoadConfig::default()
        };
        assert_eq!(weights_file_name(&config).unwrap(), "custom.gguf");
    }

    #[test]
    fn webgpu_and_inline_weights_are_rejected() {
        let webgpu = LoadConfig {
            device: DeviceKind::WebGpu,
            ..LoadConfig::default()
        };
        assert!(matches!(
            check_supported(&webgpu),
            Err(ChatError::Unsupported { .. })
        ));

        let inline = LoadConfig {
            use_external_data_format: false,
            ..LoadConfig::default()
        };
        assert!(matches!(
            check_supported(&inline),
            Err(ChatError::Unsupported { .. })
        ));
        assert!(check_supported(&LoadConfig::default()).is_ok());
    }

    #[test]
    fn cpu_device_is_always_available() {
        assert!(matches!(select_device(DeviceKind::Cpu), Ok(Device::Cpu)));
    }

    #[test]
    fn sampling_is_greedy_without_temperature() {
        let greedy = GenerationParams::default();
        assert!(matches!(sampling(&greedy), Sampling::ArgMax));

        let nucleus = GenerationParams {
            temperature: Some(0.7),
            top_p: Some(0.9),
            ..GenerationParams::default()
        };
        assert!(matches!(sampling(&nucleus), Sampling::TopP { .. }));
    }

    fn budget_and_interrupt(budget: usize) -> (InterruptHandle, StoppingCriteriaList) {
        let handle = InterruptHandle::new();
        handle.arm();
        let list = StoppingCriteriaList::new()
            .push(handle.clone())
            .push(MaxNewTokens(budget));
        (handle, list)
    }

    #[test]
    fn stop_check_continues_until_something_fires() {
        let (_handle, stopping) = budget_and_interrupt(8);
        assert_eq!(stop_check(&[], &[7], 10, 4096, &stopping), None);
        assert_eq!(stop_check(&[1, 2], &[7], 12, 4096, &stopping), None);
    }

    #[test]
    fn end_of_sequence_wins_over_interrupt_and_budget() {
        let (handle, stopping) = budget_and_interrupt(2);
        handle.interrupt();
        assert_eq!(
            stop_check(&[1, 7], &[7], 12, 4096, &stopping),
            Some(StopReason::EndOfSequence)
        );
    }

    #[test]
    fn interrupt_is_reported_before_the_budget() {
        let (handle, stopping) = budget_and_interrupt(2);
        assert_eq!(
            stop_check(&[1, 2], &[7], 12, 4096, &stopping),
            Some(StopReason::MaxNewTokens)
        );
        handle.interrupt();
        assert_eq!(
            stop_check(&[1, 2], &[7], 12, 4096, &stopping),
            Some(StopReason::Interrupted)
        );
    }

    #[test]
    fn full_context_window_ends_generation() {
        let (_handle, stopping) = budget_and_interrupt(1024);
        assert_eq!(
            stop_check(&[1], &[7], 4096, 4096, &stopping),
            Some(StopReason::MaxNewTokens)
        );
    }

    #[tokio::test]
    async fn unsupported_config_fails_before_any_download() {
        let config = LoadConfig {
            device: DeviceKind::WebGpu,
            ..LoadConfig::default()
        };
        let err = CandleLoader::new().load(&config).await.unwrap_err();
        assert!(matches!(err, ChatError::Unsupported { .. }));
    }
}
