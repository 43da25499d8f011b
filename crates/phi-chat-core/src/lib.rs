//! Local chat completion over a quantized causal language model.
//!
//! The crate glues an external ML runtime (tokenizer + model) to a
//! persisted conversation history:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use phi_chat_core::{ChatSession, ChatTurn, ConversationStore, FileStore, GenerationOptions};
//! use phi_chat_core::provider::ModelProvider;
//! use phi_chat_core::runtime::LoadConfig;
//!
//! # #[cfg(feature = "candle")]
//! # async fn demo() -> Result<(), phi_chat_core::ChatError> {
//! let provider = ModelProvider::new(
//!     Arc::new(phi_chat_core::backend::candle::CandleLoader::new()),
//!     LoadConfig::default(),
//! );
//! let (store, _status) = ConversationStore::load(Box::new(FileStore::new("./data")?), "chat_memory")?;
//! let session = ChatSession::new(Arc::new(provider), store, GenerationOptions::default());
//!
//! let reply = session.generate(vec![ChatTurn::user("Hi")]).await?;
//! println!("{reply}");
//! # Ok(())
//! # }
//! ```

mod error;
mod types;

pub mod backend;
pub mod interrupt;
pub mod metrics;
pub mod provider;
pub mod runtime;
pub mod session;
pub mod storage;

pub use error::ChatError;
pub use interrupt::InterruptHandle;
pub use metrics::GenerationMetrics;
pub use session::{ChatSession, GenerationOptions, GenerationOutcome, StreamChunk, StreamHandle};
pub use storage::conversation::{ConversationStore, LoadStatus};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use types::{ChatTurn, ConversationHistory, Role};
