//! Jinja chat templates as shipped in Hugging Face `tokenizer_config.json`.

use minijinja::{Environment, Error, ErrorKind, context};
use serde::Deserialize;
use serde_json::Value;

use crate::{ChatError, ChatTurn};

const PHI3_TEMPLATE: &str = "{% for message in messages %}\
{% if message.role == 'system' %}{{ '<|system|>\\n' ~ message.content ~ '<|end|>\\n' }}\
{% elif message.role == 'user' %}{{ '<|user|>\\n' ~ message.content ~ '<|end|>\\n' }}\
{% elif message.role == 'assistant' %}{{ '<|assistant|>\\n' ~ message.content ~ '<|end|>\\n' }}\
{% endif %}{% endfor %}\
{% if add_generation_prompt %}{{ '<|assistant|>\\n' }}{% else %}{{ eos_token }}{% endif %}";

#[derive(Debug, Clone)]
pub struct ChatTemplate {
    source: String,
    bos_token: String,
    eos_token: String,
}

impl ChatTemplate {
    /// Compile-check `source` and keep it for rendering.
    pub fn new(
        source: impl Into<String>,
        bos_token: impl Into<String>,
        eos_token: impl Into<String>,
    ) -> Result<Self, ChatError> {
        let source = source.into();
        Environment::new()
            .template_from_str(&source)
            .map_err(ChatError::template)?;
        Ok(Self {
            source,
            bos_token: bos_token.into(),
            eos_token: eos_token.into(),
        })
    }

    /// Built-in Phi-3 instruct template, used when the tokenizer config has none.
    pub fn phi3() -> Self {
        Self {
            source: PHI3_TEMPLATE.to_owned(),
            bos_token: "<s>".to_owned(),
            eos_token: "<|endoftext|>".to_owned(),
        }
    }

    /// Build the template carried by a `tokenizer_config.json`.
    ///
    /// Returns `Ok(None)` when the config has no `chat_template`. Named
    /// template lists pick the `default` entry.
    pub fn from_tokenizer_config(raw: &str) -> Result<Option<Self>, ChatError> {
        let config: TokenizerConfig = serde_json::from_str(raw).map_err(ChatError::template)?;
        let source = match config.chat_template {
            Some(Value::String(source)) => source,
            Some(Value::Array(named)) => match named.iter().find_map(|entry| {
                (entry.get("name")?.as_str()? == "default")
                    .then(|| entry.get("template")?.as_str().map(str::to_owned))
                    .flatten()
            }) {
                Some(source) => source,
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
        let bos = config.bos_token.as_ref().and_then(special_token_text);
        let eos = config.eos_token.as_ref().and_then(special_token_text);
        Self::new(source, bos.unwrap_or_default(), eos.unwrap_or_default()).map(Some)
    }

    pub fn bos_token(&self) -> &str {
        &self.bos_token
    }

    pub fn eos_token(&self) -> &str {
        &self.eos_token
    }

    pub fn render(&self, turns: &[ChatTurn], add_generation_prompt: bool) -> Result<String, ChatError> {
        let mut env = Environment::new();
        env.add_function("raise_exception", raise_exception);
        let template = env
            .template_from_str(&self.source)
            .map_err(ChatError::template)?;
        template
            .render(context! {
                messages => turns,
                add_generation_prompt => add_generation_prompt,
                bos_token => &self.bos_token,
                eos_token => &self.eos_token,
            })
            .map_err(ChatError::template)
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenizerConfig {
    #[serde(default)]
    chat_template: Option<Value>,
    #[serde(default)]
    bos_token: Option<Value>,
    #[serde(default)]
    eos_token: Option<Value>,
}

/// Special tokens appear either as plain strings or as `{"content": ..}`.
fn special_token_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => map.get("content")?.as_str().map(str::to_owned),
        _ => None,
    }
}

fn raise_exception(message: String) -> Result<String, Error> {
    Err(Error::new(ErrorKind::InvalidOperation, message))
}
