use std::path::PathBuf;

use clap::Parser;
use phi_chat_core::runtime::{DeviceKind, Dtype};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "phi-chat")]
#[command(version, about = "Chat with a local Phi-3 model; the conversation is kept between runs")]
pub struct Cli {
    /// Hub repository holding the GGUF weights
    #[arg(long)]
    pub model: Option<String>,

    /// Hub repository holding the tokenizer
    #[arg(long)]
    pub tokenizer: Option<String>,

    /// Weight file inside the model repository
    #[arg(long)]
    pub weights_file: Option<String>,

    /// Weight precision (q4, q4f16, q8, f16, f32)
    #[arg(long)]
    pub dtype: Option<Dtype>,

    /// Execution device (auto, cpu, cuda[:N], metal[:N])
    #[arg(long)]
    pub device: Option<DeviceKind>,

    /// Directory holding the persisted conversation
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Storage key of the conversation
    #[arg(long)]
    pub history_key: Option<String>,

    /// Maximum tokens generated per answer
    #[arg(long)]
    pub max_new_tokens: Option<usize>,

    /// Sampling temperature; greedy decoding when unset
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Nucleus sampling threshold
    #[arg(long)]
    pub top_p: Option<f64>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Keep the partial answer when a generation is interrupted
    #[arg(long)]
    pub persist_interrupted: bool,

    /// System prompt placed before a fresh conversation
    #[arg(long)]
    pub system: Option<String>,

    /// Ask a single question and exit instead of starting the REPL
    pub prompt: Option<String>,
}

impl Cli {
    /// Flags given on the command line win over the environment.
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(model) = &self.model {
            cfg.model_id = model.clone();
        }
        if let Some(tokenizer) = &self.tokenizer {
            cfg.tokenizer_id = tokenizer.clone();
        }
        if let Some(file) = &self.weights_file {
            cfg.weights_file = Some(file.clone());
        }
        if let Some(dtype) = self.dtype {
            cfg.dtype = dtype;
        }
        if let Some(device) = self.device {
            cfg.device = device;
        }
        if let Some(dir) = &self.data_dir {
            cfg.data_dir = dir.clone();
        }
        if let Some(key) = &self.history_key {
            cfg.history_key = key.clone();
        }
        if let Some(n) = self.max_new_tokens {
            cfg.max_new_tokens = n;
        }
        if self.temperature.is_some() {
            cfg.temperature = self.temperature;
        }
        if self.top_p.is_some() {
            cfg.top_p = self.top_p;
        }
        if let Some(seed) = self.seed {
            cfg.seed = seed;
        }
        cfg.persist_interrupted |= self.persist_interrupted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "phi-chat",
            "--device",
            "cpu",
            "--dtype",
            "f16",
            "--max-new-tokens",
            "16",
            "--persist-interrupted",
            "Hello?",
        ]);
        let mut cfg = Config::from_env();
        cli.apply(&mut cfg);

        assert_eq!(cfg.device, DeviceKind::Cpu);
        assert_eq!(cfg.dtype, Dtype::F16);
        assert_eq!(cfg.max_new_tokens, 16);
        assert!(cfg.persist_interrupted);
        assert_eq!(cli.prompt.as_deref(), Some("Hello?"));
    }
}
