use thiserror::Error;

#[derive(Debug, Error)]
/// All errors the chat layer can throw
pub enum ChatError {
    /// The tokenizer or model could not be resolved, downloaded or built.
    #[error("Failed to load model {model_id}")]
    Load {
        model_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The requested configuration cannot be served by the runtime.
    #[error("Unsupported runtime configuration: {what}")]
    Unsupported { what: String },

    /// Reading or writing the durable key-value slot failed.
    #[error("Storage error on key {key}")]
    Storage {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to render chat template")]
    Template {
        #[source]
        source: anyhow::Error,
    },

    #[error("Tokenizer error")]
    Tokenizer {
        #[source]
        source: anyhow::Error,
    },

    #[error("Generation failed")]
    Generation {
        #[source]
        source: anyhow::Error,
    },

    /// Another generation is already in flight on this session.
    #[error("A generation is already in progress")]
    Busy,

    #[error("Lock poisoned while trying to {operation}")]
    LockPoisoned { operation: &'static str },

    #[error("Generation worker panicked")]
    WorkerPanicked {
        #[source]
        source: tokio::task::JoinError,
    },
}

impl ChatError {
    pub fn load(model_id: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        ChatError::Load {
            model_id: model_id.into(),
            source: source.into(),
        }
    }

    pub fn storage(key: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        ChatError::Storage {
            key: key.into(),
            source: source.into(),
        }
    }

    pub fn template(source: impl Into<anyhow::Error>) -> Self {
        ChatError::Template {
            source: source.into(),
        }
    }

    pub fn tokenizer(source: impl Into<anyhow::Error>) -> Self {
        ChatError::Tokenizer {
            source: source.into(),
        }
    }

    pub fn generation(source: impl Into<anyhow::Error>) -> Self {
        ChatError::Generation {
            source: source.into(),
        }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        ChatError::Unsupported { what: what.into() }
    }
}
