//! Shared-engine lock.
//!
//! Serializes calls into an inference engine that cannot run concurrently
//! across workers. Backed by a counting semaphore so the limit can be
//! raised once the engine allows it.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::trace;

use competence_core::{
    ChatMessage, Classification, EmbeddingBackend, Error, GenerationBackend, NliBackend, Result,
    Vector,
};

/// Cloneable handle to one shared semaphore.
#[derive(Clone, Debug)]
pub struct EngineLock {
    semaphore: Arc<Semaphore>,
    permits: usize,
}

impl EngineLock {
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            permits,
        }
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `fut` while holding a permit.
    ///
    /// The permit is released when `fut` finishes, fails, or is dropped.
    pub async fn with_lock<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::Internal("Engine lock closed".into()))?;
        trace!(available = self.semaphore.available_permits(), "Engine lock acquired");
        fut.await
    }
}

impl Default for EngineLock {
    fn default() -> Self {
        Self::new(competence_core::defaults::ENGINE_LOCK_PERMITS)
    }
}

/// Backend whose every call runs under an [`EngineLock`].
pub struct Locked<B: ?Sized> {
    inner: Arc<B>,
    lock: EngineLock,
}

impl<B: ?Sized> Locked<B> {
    pub fn new(inner: Arc<B>, lock: EngineLock) -> Self {
        Self { inner, lock }
    }
}

#[async_trait]
impl EmbeddingBackend for Locked<dyn EmbeddingBackend> {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        self.lock.with_lock(self.inner.embed_texts(texts)).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[async_trait]
impl GenerationBackend for Locked<dyn GenerationBackend> {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        self.lock.with_lock(self.inner.chat(messages)).await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[async_trait]
impl NliBackend for Locked<dyn NliBackend> {
    async fn classify(
        &self,
        text: &str,
        labels: &[&str],
        hypothesis_template: &str,
    ) -> Result<Classification> {
        self.lock
            .with_lock(self.inner.classify(text, labels, hypothesis_template))
            .await
    }

    async fn health_check(&self) -> Result<bool> {
        self.inner.health_check().await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn track(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Result<()> {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_permit_serializes() {
        let lock = EngineLock::new(1);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let calls = (0..4).map(|_| lock.with_lock(track(active.clone(), peak.clone())));
        for result in futures::future::join_all(calls).await {
            result.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(lock.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_permits_allow_parallelism() {
        let lock = EngineLock::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let calls = (0..4).map(|_| lock.with_lock(track(active.clone(), peak.clone())));
        futures::future::join_all(calls).await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_released_on_error() {
        let lock = EngineLock::new(1);
        let result: Result<()> = lock
            .with_lock(async { Err(Error::Internal("boom".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(lock.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_when_dropped() {
        let lock = EngineLock::new(1);
        let held = lock.with_lock(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_secs(1), held).await;
        assert!(timed_out.is_err());
        assert_eq!(lock.available(), 1);
    }

    #[test]
    fn test_zero_permits_clamped() {
        assert_eq!(EngineLock::new(0).permits(), 1);
    }
}
