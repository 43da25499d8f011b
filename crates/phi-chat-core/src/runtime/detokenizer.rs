use super::ChatTokenizer;
use crate::ChatError;

/// Turns a stream of token ids into text increments.
///
/// Byte-level and sentencepiece vocabularies do not map one token to one
/// printable piece: a multi-byte character may span several tokens and a
/// leading space is only rendered relative to the previous token. Each step
/// therefore decodes a short window ending at the new token and emits only
/// what grew past the previous window. Text ending in a replacement
/// character is held back until the character completes.
#[derive(Debug, Default)]
pub struct IncrementalDecoder {
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl IncrementalDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one id; returns the new text, empty when nothing printable was
    /// completed by this token.
    pub fn next_token(
        &mut self,
        tokenizer: &dyn ChatTokenizer,
        id: u32,
    ) -> Result<String, ChatError> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            tokenizer.decode(&self.tokens[self.prev_index..self.current_index], true)?
        };
        self.tokens.push(id);
        let text = tokenizer.decode(&self.tokens[self.prev_index..], true)?;

        if text.len() > prev_text.len() && !text.ends_with('\u{FFFD}') {
            let delta = text
                .get(prev_text.len()..)
                .unwrap_or_default()
                .to_owned();
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            Ok(delta)
        } else {
            Ok(String::new())
        }
    }
}
