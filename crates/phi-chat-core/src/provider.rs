//! Lazily loaded tokenizer/model pair.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::ChatError;
use crate::runtime::{LoadConfig, LoadProgress, LoadedModel, ModelLoader};

/// Holds at most one [`LoadedModel`] for its whole lifetime.
///
/// The first [`ModelProvider::get`] call starts the load; callers arriving
/// while it runs await the same load instead of starting another one. A
/// failed load is returned to every waiter and nothing is cached, so a later
/// call starts a fresh attempt. No retry happens on its own.
pub struct ModelProvider {
    loader: Arc<dyn ModelLoader>,
    config: LoadConfig,
    instance: OnceCell<Arc<LoadedModel>>,
}

impl ModelProvider {
    pub fn new(loader: Arc<dyn ModelLoader>, config: LoadConfig) -> Self {
        Self {
            loader,
            config,
            instance: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.instance.initialized()
    }

    pub async fn get(&self) -> Result<Arc<LoadedModel>, ChatError> {
        self.instance
            .get_or_try_init(|| async {
                info!(
                    model_id = %self.config.model_id,
                    tokenizer_id = %self.config.tokenizer_id,
                    dtype = %self.config.dtype,
                    device = %self.config.device,
                    "loading tokenizer and model"
                );
                match self.loader.load(&self.config).await {
                    Ok(loaded) => {
                        self.config.report(LoadProgress::Ready {
                            model_id: self.config.model_id.clone(),
                        });
                        info!(model_id = %self.config.model_id, "model ready");
                        Ok(Arc::new(loaded))
                    }
                    Err(e) => {
                        error!(model_id = %self.config.model_id, error = %e, "model load failed");
                        Err(e)
                    }
                }
            })
            .await
            .cloned()
    }
}

impl std::fmt::Debug for ModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelProvider")
            .field("config", &self.config)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::{MockModel, MockTokenizer};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingLoader {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(&self, config: &LoadConfig) -> Result<LoadedModel, ChatError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            config.report(LoadProgress::Initiate {
                file: "weights.gguf".into(),
            });
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_first && call == 0 {
                return Err(ChatError::load(&config.model_id, anyhow::anyhow!("network down")));
            }
            Ok(LoadedModel::new(
                Arc::new(MockTokenizer::default()),
                Box::new(MockModel::scripted(&[])),
            ))
        }
    }

    #[tokio::test]
    async fn concurrent_first_use_loads_once() {
        let loader = Arc::new(CountingLoader::default());
        let provider = ModelProvider::new(loader.clone(), LoadConfig::default());

        let (a, b) = tokio::join!(provider.get(), provider.get());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(provider.is_loaded());

        let c = provider.get().await.unwrap();
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn load_failure_propagates_and_is_not_cached() {
        let loader = Arc::new(CountingLoader {
            fail_first: true,
            ..Default::default()
        });
        let provider = ModelProvider::new(loader.clone(), LoadConfig::default());

        let err = provider.get().await.unwrap_err();
        assert!(matches!(err, ChatError::Load { .. }));
        assert!(!provider.is_loaded());

        provider.get().await.expect("second attempt loads");
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn progress_callback_sees_initiate_and_ready() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let config = LoadConfig {
            progress: Some(Arc::new(move |event: LoadProgress| {
                sink.lock().unwrap().push(event)
            })),
            ..LoadConfig::default()
        };
        let provider = ModelProvider::new(Arc::new(CountingLoader::default()), config);
        provider.get().await.unwrap();

        let events = events.lock().unwrap();
        assert!(matches!(events.first(), Some(LoadProgress::Initiate { .. })));
        assert!(matches!(events.last(), Some(LoadProgress::Ready { .. })));
    }
}
