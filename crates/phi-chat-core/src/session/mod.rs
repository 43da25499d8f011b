//! Generation driver: history + new turns in, assistant text out.

mod admission;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::interrupt::{InterruptHandle, MaxNewTokens, StoppingCriteriaList};
use crate::metrics::{GenerationMetrics, ThroughputTracker};
use crate::provider::ModelProvider;
use crate::runtime::{GeneratedToken, GenerationParams, StopReason, TokenSink};
use crate::{ChatError, ChatTurn, ConversationHistory, ConversationStore};

use admission::AdmissionGate;

// ── Streaming protocol ────────────────────────────────────────────────────────

/// A chunk of streaming output from a generation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// A piece of generated text.
    Token(String),
    /// Generation completed (normally or interrupted).
    Done,
    /// Generation terminated due to an error.
    Error(String),
}

pub type StreamSender = mpsc::UnboundedSender<StreamChunk>;

/// Yields [`StreamChunk`] items as tokens are produced. The stream ends with
/// [`StreamChunk::Done`] or [`StreamChunk::Error`].
pub type StreamHandle = mpsc::UnboundedReceiver<StreamChunk>;

pub fn stream_channel() -> (StreamSender, StreamHandle) {
    mpsc::unbounded_channel()
}

// ── Options & outcome ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    pub params: GenerationParams,
    /// Commit the partial answer of an interrupted generation to the history.
    pub persist_interrupted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    /// Decoded assistant text, special tokens removed.
    pub text: String,
    pub stop_reason: StopReason,
    pub metrics: GenerationMetrics,
    /// Whether the new turns and the answer were committed to the store.
    pub persisted: bool,
}

impl GenerationOutcome {
    pub fn interrupted(&self) -> bool {
        self.stop_reason == StopReason::Interrupted
    }
}

// ── Token sink ────────────────────────────────────────────────────────────────

/// Runs inside the generation loop: counts tokens and forwards text.
///
/// Kept side-effect-light; a closed receiver only stops forwarding, it never
/// affects generation.
struct StreamingSink {
    tracker: ThroughputTracker,
    tx: Option<StreamSender>,
}

impl StreamingSink {
    fn new(tx: Option<StreamSender>) -> Self {
        Self {
            tracker: ThroughputTracker::new(),
            tx,
        }
    }
}

impl TokenSink for StreamingSink {
    fn on_token(&mut self, token: &GeneratedToken) {
        self.tracker.record();
        if let Some(tps) = self.tracker.tokens_per_second() {
            trace!(tokens = self.tracker.num_tokens(), tps, "token streamed");
        }
        if token.text.is_empty() {
            return;
        }
        if let Some(tx) = &self.tx {
            if tx.send(StreamChunk::Token(token.text.clone())).is_err() {
                debug!("stream receiver dropped; continuing without forwarding");
                self.tx = None;
            }
        }
    }
}

// ── Interrupt scoping ─────────────────────────────────────────────────────────

/// Returns the interrupt handle to idle when the generation worker finishes.
struct ArmedInterrupt(InterruptHandle);

impl ArmedInterrupt {
    fn arm(handle: &InterruptHandle) -> Self {
        handle.arm();
        Self(handle.clone())
    }
}

impl Drop for ArmedInterrupt {
    fn drop(&mut self) {
        self.0.disarm();
    }
}

/// Interrupts the worker if the awaiting caller goes away before it returns.
struct InterruptOnDrop(Option<InterruptHandle>);

impl InterruptOnDrop {
    fn defuse(mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            if handle.interrupt() {
                warn!("generation caller dropped; interrupting worker");
            }
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// One chat session: a model provider, a persisted history and the interrupt
/// handle shared by all of its generations.
///
/// At most one generation runs at a time; a concurrent request is rejected
/// with [`ChatError::Busy`].
pub struct ChatSession {
    provider: Arc<ModelProvider>,
    store: Mutex<ConversationStore>,
    interrupt: InterruptHandle,
    gate: AdmissionGate,
    options: GenerationOptions,
}

impl ChatSession {
    pub fn new(
        provider: Arc<ModelProvider>,
        store: ConversationStore,
        options: GenerationOptions,
    ) -> Self {
        Self {
            provider,
            store: Mutex::new(store),
            interrupt: InterruptHandle::new(),
            gate: AdmissionGate::new(),
            options,
        }
    }

    /// Stop the in-flight generation. Returns `false` when none is running.
    pub fn interrupt(&self) -> bool {
        let interrupted = self.interrupt.interrupt();
        if interrupted {
            info!("generation interrupt requested");
        }
        interrupted
    }

    pub fn is_generating(&self) -> bool {
        self.gate.is_busy()
    }

    /// Resolve the tokenizer and model ahead of the first generation.
    pub async fn load_model(&self) -> Result<(), ChatError> {
        self.provider.get().await.map(|_| ())
    }

    pub fn history(&self) -> Result<ConversationHistory, ChatError> {
        let store = self.lock_store()?;
        Ok(store.history().to_vec())
    }

    /// Forget the conversation. Rejected with [`ChatError::Busy`] while a
    /// generation is running.
    pub fn clear_history(&self) -> Result<(), ChatError> {
        let _permit = self.gate.try_acquire()?;
        self.lock_store()?.clear()
    }

    /// Generate the assistant's answer to `turns` and return its text.
    pub async fn generate(&self, turns: Vec<ChatTurn>) -> Result<String, ChatError> {
        self.generate_with_stream(turns, None)
            .await
            .map(|outcome| outcome.text)
    }

    /// Generate the assistant's answer to `turns`, streaming text increments
    /// to `stream` when given.
    ///
    /// The stored history followed by `turns` is rendered through the chat
    /// template and handed to the model. On success `turns` and the answer are
    /// appended to the store in one write. Nothing is stored when any step
    /// fails, nor when the generation was interrupted unless
    /// [`GenerationOptions::persist_interrupted`] is set.
    pub async fn generate_with_stream(
        &self,
        turns: Vec<ChatTurn>,
        stream: Option<StreamSender>,
    ) -> Result<GenerationOutcome, ChatError> {
        let result = self.run_generation(turns, stream.clone()).await;
        if let Some(tx) = stream {
            let _ = match &result {
                Ok(_) => tx.send(StreamChunk::Done),
                Err(e) => tx.send(StreamChunk::Error(e.to_string())),
            };
        }
        result
    }

    async fn run_generation(
        &self,
        turns: Vec<ChatTurn>,
        stream: Option<StreamSender>,
    ) -> Result<GenerationOutcome, ChatError> {
        // Shared with the worker so the slot stays taken until the model
        // returns, even if this future is dropped first.
        let permit = Arc::new(self.gate.try_acquire()?);
        let loaded = self.provider.get().await?;

        let mut conversation = self.history()?;
        let prior_turns = conversation.len();
        conversation.extend(turns.iter().cloned());

        let input = loaded
            .tokenizer
            .apply_chat_template(&conversation, true)?;
        debug!(
            prior_turns,
            new_turns = turns.len(),
            input_tokens = input.input_ids.len(),
            "prompt encoded"
        );

        let armed = ArmedInterrupt::arm(&self.interrupt);
        let params = self.options.params.clone();
        // Interrupt first: when both fire, the caller asked to stop.
        let stopping = StoppingCriteriaList::new()
            .push(self.interrupt.clone())
            .push(MaxNewTokens(params.max_new_tokens));
        let model = Arc::clone(&loaded.model);
        let mut sink = StreamingSink::new(stream);
        let worker_permit = Arc::clone(&permit);

        let worker = tokio::task::spawn_blocking(move || {
            // Dropped in reverse order: disarm before the slot is released.
            let _permit = worker_permit;
            let _armed = armed;
            let mut model = model.lock().map_err(|_| ChatError::LockPoisoned {
                operation: "lock model for generation",
            })?;
            let output = model.generate(&input, &params, &stopping, &mut sink)?;
            Ok::<_, ChatError>((output, sink.tracker.snapshot()))
        });

        let cancel_guard = InterruptOnDrop(Some(self.interrupt.clone()));
        let joined = worker.await;
        cancel_guard.defuse();

        let (output, metrics) = match joined {
            Ok(result) => result?,
            Err(source) => return Err(ChatError::WorkerPanicked { source }),
        };

        let text = loaded.tokenizer.decode(&output.tokens, true)?;

        let persisted =
            output.stop_reason != StopReason::Interrupted || self.options.persist_interrupted;
        if persisted {
            let answer = ChatTurn::assistant(text.clone());
            self.lock_store()?
                .extend(turns.into_iter().chain(std::iter::once(answer)))?;
        }

        info!(
            tokens = metrics.num_tokens,
            tps = metrics.tokens_per_second.unwrap_or_default(),
            stop_reason = %output.stop_reason,
            persisted,
            "generation finished"
        );
        drop(permit);

        Ok(GenerationOutcome {
            text,
            stop_reason: output.stop_reason,
            metrics,
            persisted,
        })
    }

    fn lock_store(&self) -> Result<std::sync::MutexGuard<'_, ConversationStore>, ChatError> {
        self.store.lock().map_err(|_| ChatError::LockPoisoned {
            operation: "lock conversation store",
        })
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("provider", &self.provider)
            .field("interrupt", &self.interrupt.state())
            .field("generating", &self.is_generating())
            .finish_non_exhaustive()
    }
}
