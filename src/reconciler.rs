//! Background reconciliation of vectorless memories.
//!
//! An interval-driven task that sweeps every tenant, embeds memories whose
//! vectors are missing, and attaches the results, keeping the vector index
//! eventually consistent with the text store. Failure containment: a
//! circuit breaker bounds retry storms against a failing provider, and all
//! sleeps are interruptible by the stop signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::tenant::{TenantId, TenantPool};

/// Consecutive-failure counter that trips into a single long backoff.
/// Any success resets the counter to zero immediately.
struct CircuitBreaker {
    threshold: u32,
    backoff: Duration,
    consecutive: u32,
}

impl CircuitBreaker {
    fn new(threshold: u32, backoff: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            backoff,
            consecutive: 0,
        }
    }

    /// Returns the backoff to sleep when the threshold is reached; the
    /// counter resets on trip so the next failure starts a fresh count.
    fn record_failure(&mut self) -> Option<Duration> {
        self.consecutive += 1;
        if self.consecutive < self.threshold {
            return None;
        }
        self.consecutive = 0;
        Some(self.backoff)
    }

    fn record_success(&mut self) {
        self.consecutive = 0;
    }
}

/// Sleep that a stop signal short-circuits. Returns true if stopped.
async fn sleep_or_stop(stop: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *stop.borrow() {
        return true;
    }
    if duration.is_zero() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => *stop.borrow(),
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
    }
}

/// Background worker that embeds vectorless memories across all tenants
pub struct EmbedReconciler {
    pool: Arc<TenantPool>,
    embedder: Arc<dyn EmbeddingProvider>,
    interval: Duration,
    batch_size: usize,
    sub_batch: usize,
    sleep_between: Duration,
    breaker: CircuitBreaker,
}

impl EmbedReconciler {
    pub fn new(pool: Arc<TenantPool>, embedder: Arc<dyn EmbeddingProvider>, config: &Config) -> Self {
        Self {
            pool,
            embedder,
            interval: config.reconciler_interval.max(Duration::from_secs(1)),
            batch_size: config.reconciler_batch_size.max(1),
            sub_batch: config.reconciler_sub_batch.max(1),
            sleep_between: config.reconciler_sleep_between,
            breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_backoff),
        }
    }

    /// Spawn the background loop, returning the handle used to stop it
    pub fn start(self) -> ReconcilerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        info!(
            interval = ?self.interval,
            batch_size = self.batch_size,
            sub_batch = self.sub_batch,
            "embed reconciler started"
        );
        let task = tokio::spawn(self.run(stop_rx));
        ReconcilerHandle { stop_tx, task }
    }

    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        loop {
            self.sweep(&mut stop).await;
            if sleep_or_stop(&mut stop, self.interval).await {
                break;
            }
        }
    }

    async fn sweep(&mut self, stop: &mut watch::Receiver<bool>) {
        for tenant in self.pool.list_tenants() {
            if *stop.borrow() {
                return;
            }
            if let Err(e) = self.process_tenant(&tenant, stop).await {
                error!(tenant = %tenant, "reconciler failed for tenant: {e}");
            }
        }
    }

    async fn process_tenant(
        &mut self,
        tenant: &TenantId,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let store = self.pool.get(tenant)?;
        let pending = store.list_pending_vectors()?;
        if pending.is_empty() {
            return Ok(());
        }
        info!(tenant = %tenant, pending = pending.len(), "embedding vectorless memories");

        for (batch_index, batch) in pending.chunks(self.batch_size).enumerate() {
            if *stop.borrow() {
                return Ok(());
            }

            let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
            let vectors = match self.embed_sub_batched(&texts).await {
                Ok(vectors) => vectors,
                Err(e) => {
                    warn!(tenant = %tenant, "batch embed failed: {e}");
                    if let Some(backoff) = self.breaker.record_failure() {
                        error!(
                            backoff = ?backoff,
                            "circuit breaker opened after consecutive embedding failures"
                        );
                        if sleep_or_stop(stop, backoff).await {
                            return Ok(());
                        }
                    }
                    if sleep_or_stop(stop, self.sleep_between).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            if vectors.len() != batch.len() {
                warn!(
                    tenant = %tenant,
                    got = vectors.len(),
                    expected = batch.len(),
                    "vector count mismatch; unmatched memories treated as failures"
                );
            }

            // Vectors match memories by position; a missing slot is a
            // per-memory failure, not a crash.
            let mut updated = 0usize;
            for (position, (memory_id, _)) in batch.iter().enumerate() {
                match vectors.get(position) {
                    None => {
                        warn!(tenant = %tenant, memory = %memory_id, "no vector generated for memory");
                        if let Some(backoff) = self.breaker.record_failure() {
                            error!(
                                backoff = ?backoff,
                                "circuit breaker opened after consecutive embedding failures"
                            );
                            if sleep_or_stop(stop, backoff).await {
                                return Ok(());
                            }
                        }
                    }
                    Some(vector) => {
                        self.breaker.record_success();
                        match store.attach_vector(memory_id, vector) {
                            Ok(true) => updated += 1,
                            Ok(false) => {
                                debug!(memory = %memory_id, "memory deleted before vector attach")
                            }
                            Err(e) => warn!(memory = %memory_id, "vector attach failed: {e}"),
                        }
                    }
                }
            }

            if updated > 0 {
                if let Err(e) = store.invalidate_cache() {
                    warn!(tenant = %tenant, "cache invalidation failed: {e}");
                }
                info!(tenant = %tenant, updated, "attached vectors");
            }

            let has_more = (batch_index + 1) * self.batch_size < pending.len();
            if has_more && sleep_or_stop(stop, self.sleep_between).await {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Keep individual provider calls small so a retry is cheap
    async fn embed_sub_batched(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.sub_batch) {
            vectors.extend(self.embedder.embed_batch(chunk).await?);
        }
        Ok(vectors)
    }
}

/// Handle to a running reconciler task
pub struct ReconcilerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Request cooperative exit, wait up to `timeout`, then force-cancel.
    /// The loop is reported stopped afterwards regardless of which path ran.
    pub async fn stop(mut self, timeout: Duration) {
        let _ = self.stop_tx.send(true);
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("reconciler task ended abnormally during stop: {e}"),
            Err(_) => {
                warn!("reconciler stop timed out; cancelling task");
                self.task.abort();
                let _ = (&mut self.task).await;
            }
        }
        info!("embed reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::memory::Memory;
    use crate::tenant::Access;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct StubEmbedder {
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubEmbedder {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl crate::embedding::EmbeddingProvider for StubEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let batch = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
            Ok(batch.into_iter().next().unwrap())
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(crate::error::Error::embedding("stub failure"));
            }
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3, 0.4]).collect())
        }

        fn dimensions(&self) -> usize {
            4
        }
    }

    /// Returns one vector fewer than requested, as a provider that silently
    /// drops an input would
    struct ShortEmbedder;

    #[async_trait]
    impl crate::embedding::EmbeddingProvider for ShortEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.1, 0.2, 0.3, 0.4])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let short = texts.len().saturating_sub(1);
            Ok((0..short).map(|_| vec![0.1, 0.2, 0.3, 0.4]).collect())
        }

        fn dimensions(&self) -> usize {
            4
        }
    }

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::with_data_dir(dir);
        config.embed_dimensions = 4;
        config.reconciler_interval = Duration::from_secs(1);
        config.reconciler_sleep_between = Duration::from_millis(0);
        config
    }

    #[test]
    fn breaker_trips_at_threshold_and_resets_on_success() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(300));
        assert!(breaker.record_failure().is_none());
        assert!(breaker.record_failure().is_none());
        assert_eq!(breaker.record_failure(), Some(Duration::from_secs(300)));
        // Counter reset on trip: the next failure starts from one
        assert!(breaker.record_failure().is_none());

        breaker.record_success();
        assert!(breaker.record_failure().is_none());
        assert!(breaker.record_failure().is_none());
        assert!(breaker.record_failure().is_some());
    }

    #[tokio::test]
    async fn reconciler_attaches_pending_vectors_then_stops() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let pool = Arc::new(TenantPool::new(config.clone()));

        let tenant = TenantId::normalize("main", Access::Write).unwrap();
        let store = pool.get(&tenant).unwrap();
        store.insert(&Memory::new("needs a vector", None, None)).unwrap();
        store.insert(&Memory::new("this one too", None, None)).unwrap();
        assert_eq!(store.count_pending_vectors().unwrap(), 2);

        let embedder = Arc::new(StubEmbedder::new(false));
        let handle = EmbedReconciler::new(pool.clone(), embedder, &config).start();

        // Poll until the sweep completes rather than guessing a sleep
        for _ in 0..100 {
            if store.count_pending_vectors().unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.count_pending_vectors().unwrap(), 0);

        handle.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn short_vector_batch_attaches_prefix_and_trips_breaker() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.breaker_threshold = 1;
        config.breaker_backoff = Duration::from_secs(600);
        let pool = Arc::new(TenantPool::new(config.clone()));

        let tenant = TenantId::normalize("main", Access::Write).unwrap();
        let store = pool.get(&tenant).unwrap();
        let first = Memory::new("embedded fine", None, None);
        let second = Memory::new("dropped by the provider", None, None);
        store.insert(&first).unwrap();
        store.insert(&second).unwrap();

        let handle = EmbedReconciler::new(pool.clone(), Arc::new(ShortEmbedder), &config).start();

        // Vectors match by position: the prefix attaches, the unmatched
        // slot stays pending
        for _ in 0..100 {
            if store.count_pending_vectors().unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.count_pending_vectors().unwrap(), 1);
        assert!(store.get(&first.id).unwrap().unwrap().vector_ref.is_some());
        assert!(store.get(&second.id).unwrap().unwrap().vector_ref.is_none());

        // The unmatched slot counted as a failure and tripped the breaker
        // into its long backoff; stop must still return promptly
        let started = std::time::Instant::now();
        handle.stop(Duration::from_secs(2)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn stop_interrupts_a_failing_provider_backoff() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.breaker_threshold = 1;
        config.breaker_backoff = Duration::from_secs(600);
        let pool = Arc::new(TenantPool::new(config.clone()));

        let tenant = TenantId::normalize("main", Access::Write).unwrap();
        let store = pool.get(&tenant).unwrap();
        store.insert(&Memory::new("never embedded", None, None)).unwrap();

        let embedder = Arc::new(StubEmbedder::new(true));
        let handle = EmbedReconciler::new(pool.clone(), embedder, &config).start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Stop must complete promptly even though the breaker backoff is long
        let started = std::time::Instant::now();
        handle.stop(Duration::from_secs(2)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(store.count_pending_vectors().unwrap(), 1);
    }
}
