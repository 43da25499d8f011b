//! In-process stand-ins for the tokenizer and model.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::interrupt::StoppingCriteria;
use crate::runtime::{
    CausalLanguageModel, ChatTokenizer, EncodedInput, GeneratedToken, GenerationOutput,
    GenerationParams, StopReason, TokenSink,
};
use crate::{ChatError, ChatTurn};

/// Id 0 is the only special token.
pub(crate) const VOCAB: &[&str] = &["<|end|>", "Hello", "!", " there", " more"];

pub(crate) const END: u32 = 0;
pub(crate) const HELLO: u32 = 1;
pub(crate) const BANG: u32 = 2;
pub(crate) const THERE: u32 = 3;
pub(crate) const MORE: u32 = 4;

fn piece(id: u32, skip_special: bool) -> Option<&'static str> {
    match id {
        END if skip_special => Some(""),
        id => VOCAB.get(id as usize).copied(),
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockTokenizer {
    /// Every conversation handed to `apply_chat_template`, in call order.
    pub seen: Arc<Mutex<Vec<Vec<ChatTurn>>>>,
    pub fail_decode: bool,
}

impl MockTokenizer {
    pub fn failing_decode() -> Self {
        Self {
            fail_decode: true,
            ..Self::default()
        }
    }

    pub fn last_seen(&self) -> Option<Vec<ChatTurn>> {
        self.seen.lock().unwrap().last().cloned()
    }
}

impl ChatTokenizer for MockTokenizer {
    fn apply_chat_template(
        &self,
        turns: &[ChatTurn],
        add_generation_prompt: bool,
    ) -> Result<EncodedInput, ChatError> {
        self.seen.lock().unwrap().push(turns.to_vec());

        let mut prompt: String = turns
            .iter()
            .map(|t| format!("<|{}|>{}<|end|>", t.role, t.content))
            .collect();
        if add_generation_prompt {
            prompt.push_str("<|assistant|>");
        }
        // One id per turn is enough for the session to pass around.
        let input_ids = (0..turns.len() as u32).map(|i| 100 + i).collect();
        Ok(EncodedInput { prompt, input_ids })
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, ChatError> {
        if self.fail_decode {
            return Err(ChatError::tokenizer(anyhow::anyhow!("decode refused")));
        }
        ids.iter()
            .map(|&id| {
                piece(id, skip_special_tokens)
                    .ok_or_else(|| ChatError::tokenizer(anyhow::anyhow!("unknown id {id}")))
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
enum Script {
    /// Emit these ids, then end of sequence.
    Fixed(Vec<u32>),
    /// Emit `id` with a pause until stopped or out of budget.
    Endless { id: u32, pause: Duration },
    Fail,
}

#[derive(Debug, Clone)]
pub(crate) struct MockModel {
    script: Script,
}

impl MockModel {
    pub fn scripted(ids: &[u32]) -> Self {
        Self {
            script: Script::Fixed(ids.to_vec()),
        }
    }

    pub fn endless(id: u32) -> Self {
        Self {
            script: Script::Endless {
                id,
                pause: Duration::from_millis(5),
            },
        }
    }

    pub fn failing() -> Self {
        Self {
            script: Script::Fail,
        }
    }

    fn next_id(&self, step: usize) -> Option<u32> {
        match &self.script {
            Script::Fixed(ids) => ids.get(step).copied(),
            Script::Endless { id, pause } => {
                std::thread::sleep(*pause);
                Some(*id)
            }
            Script::Fail => None,
        }
    }
}

impl CausalLanguageModel for MockModel {
    fn generate(
        &mut self,
        _input: &EncodedInput,
        _params: &GenerationParams,
        stopping: &dyn StoppingCriteria,
        sink: &mut dyn TokenSink,
    ) -> Result<GenerationOutput, ChatError> {
        if matches!(self.script, Script::Fail) {
            return Err(ChatError::generation(anyhow::anyhow!("out of memory")));
        }

        let mut tokens = Vec::new();
        loop {
            if let Some(stop_reason) = stopping.stop_reason(&tokens) {
                return Ok(GenerationOutput {
                    tokens,
                    stop_reason,
                });
            }
            let Some(id) = self.next_id(tokens.len()) else {
                return Ok(GenerationOutput {
                    tokens,
                    stop_reason: StopReason::EndOfSequence,
                });
            };
            tokens.push(id);
            sink.on_token(&GeneratedToken {
                id,
                text: piece(id, true).unwrap_or_default().to_owned(),
            });
        }
    }
}
