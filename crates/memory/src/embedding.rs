//! The embedding seam and its process-wide disable latch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mx_domain::config::MemoryConfig;
use mx_domain::error::{Error, Result};
use mx_domain::trace::TraceEvent;

/// Produces an embedding vector for a text. Driver internals live
/// outside this crate; implementations are injected.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    fn id(&self) -> &str;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Owns the active embedder and the global disabled latch.
///
/// Any embedding failure flips the latch; once flipped, all memory work
/// becomes a no-op for the rest of the process. Writers are idempotent
/// and readers re-check on every use.
pub struct EmbeddingManager {
    embedder: Option<Arc<dyn Embedder>>,
    disabled: AtomicBool,
}

impl EmbeddingManager {
    pub fn new(embedder: Option<Arc<dyn Embedder>>, config: &MemoryConfig) -> Self {
        let disabled = config.embeddings_disabled || embedder.is_none();
        if disabled {
            tracing::info!("embeddings disabled, memory pipelines will no-op");
        }
        Self {
            embedder,
            disabled: AtomicBool::new(disabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled.load(Ordering::Acquire)
    }

    /// Flip the latch. Safe to call repeatedly; only the first call logs.
    pub fn disable(&self, reason: &str) {
        if !self.disabled.swap(true, Ordering::AcqRel) {
            tracing::warn!(reason, "disabling embeddings globally");
            TraceEvent::EmbeddingsDisabled {
                reason: reason.to_owned(),
            }
            .emit();
        }
    }

    /// Embed a text. A failure disables embeddings globally and surfaces
    /// as [`Error::EmbeddingUnavailable`].
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if !self.is_enabled() {
            return Err(Error::EmbeddingUnavailable("embeddings are disabled".into()));
        }
        let embedder = self
            .embedder
            .clone()
            .ok_or_else(|| Error::EmbeddingUnavailable("no embedder configured".into()))?;

        match embedder.embed(text).await {
            Ok(vector) => Ok(vector),
            Err(e) => {
                self.disable(&e.to_string());
                Err(Error::EmbeddingUnavailable(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyEmbedder {
        fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Embedder for FlakyEmbedder {
        fn id(&self) -> &str {
            "flaky"
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::Other("model load failed".into()))
            } else {
                Ok(vec![1.0, 0.0])
            }
        }
    }

    #[tokio::test]
    async fn failure_latches_disabled() {
        let manager = EmbeddingManager::new(
            Some(Arc::new(FlakyEmbedder {
                fail: AtomicBool::new(true),
            })),
            &MemoryConfig::default(),
        );
        assert!(manager.is_enabled());
        assert!(manager.embed("x").await.is_err());
        assert!(!manager.is_enabled());

        // Latched: even a now-healthy embedder is not consulted.
        let err = manager.embed("y").await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingUnavailable(_)));
    }

    #[tokio::test]
    async fn no_embedder_means_disabled_from_start() {
        let manager = EmbeddingManager::new(None, &MemoryConfig::default());
        assert!(!manager.is_enabled());
    }
}
