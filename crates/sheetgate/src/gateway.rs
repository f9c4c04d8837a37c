//! [`SheetGate`]: the exposed surface.
//!
//! One instance owns the cache, the rate limiter, the deduplicator, the
//! ConflictVersion registry and the batch-window task. Stats accessors return
//! copies, so nothing outside this layer can mutate its state.

use crate::backend::{SheetsBackend, SnapshotService};
use crate::cache::{CacheStats, RangeCache};
use crate::cancel::CancelToken;
use crate::config::GateConfig;
use crate::conflict::{ConflictRegistry, ConflictVersion};
use crate::dedup::{DedupStats, Deduplicator};
use crate::diff::DiffEngine;
use crate::error::{GateError, Result};
use crate::executor::{BatchExecutor, Dispatcher, IntentOutcome};
use crate::intent::Intent;
use crate::limiter::{RateLimiter, RateLimiterStats};
use crate::pipeline::Pipeline;
use crate::structure::StructureCache;
use crate::transaction::{TransactionId, TransactionInfo, TransactionManager, TransactionStatus};
use futures::future::join_all;
use sheetgate_common::GridRange;
use std::sync::Arc;

pub struct SheetGate {
    config: GateConfig,
    pipeline: Arc<Pipeline>,
    window: crate::window::BatchWindow,
    transactions: Arc<TransactionManager>,
    limiter: Arc<RateLimiter>,
    dedup: Arc<Deduplicator>,
    cache: Arc<RangeCache>,
    conflicts: Arc<ConflictRegistry>,
}

impl std::fmt::Debug for SheetGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SheetGate")
            .field("actor_id", &self.config.actor_id)
            .field("cache", &self.cache.stats())
            .field("transactions", &self.transactions)
            .finish_non_exhaustive()
    }
}

impl SheetGate {
    /// Build a gate over `backend`. Spawns the batch-window task, so this must
    /// run inside a tokio runtime.
    pub fn new(
        backend: Arc<dyn SheetsBackend>,
        snapshots: Arc<dyn SnapshotService>,
        config: GateConfig,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let dedup = Arc::new(Deduplicator::new(config.dedup.completed_ttl()));
        let cache = Arc::new(RangeCache::new(config.cache.clone()));
        let conflicts = Arc::new(ConflictRegistry::new(&config.conflicts));
        let structures = Arc::new(StructureCache::new(config.structure_ttl()));

        let dispatcher = Dispatcher::new(backend, limiter.clone(), dedup.clone(), config.retry.clone());
        let executor = BatchExecutor::new(
            dispatcher,
            cache.clone(),
            conflicts.clone(),
            structures,
            DiffEngine::new(config.diff.clone()),
            config.actor_id.as_str(),
        );
        let pipeline = Arc::new(Pipeline::new(executor, cache.clone(), &config));
        let window = crate::window::BatchWindow::spawn(pipeline.clone(), config.batch.clone());

        #[cfg(feature = "tracing")]
        tracing::debug!(
            actor_id = config.actor_id.as_str(),
            window_ms = config.batch.window_ms,
            "sheetgate started"
        );

        let transactions = Arc::new(TransactionManager::new(
            snapshots,
            config.transactions.retention(),
        ));

        Ok(Self {
            config,
            pipeline,
            window,
            transactions,
            limiter,
            dedup,
            cache,
            conflicts,
        })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Submit one intent through the batch window.
    pub async fn submit(&self, intent: Intent) -> Result<IntentOutcome> {
        self.window.submit(intent, None).await
    }

    pub async fn submit_with_cancel(&self, intent: Intent, cancel: &CancelToken) -> Result<IntentOutcome> {
        self.window.submit(intent, Some(cancel)).await
    }

    /// Submit several intents at once so they land in the same window.
    /// Results come back in input order.
    pub async fn submit_all(&self, intents: Vec<Intent>) -> Vec<Result<IntentOutcome>> {
        join_all(intents.into_iter().map(|i| self.window.submit(i, None))).await
    }

    pub async fn begin(&self, object_id: &str) -> Result<TransactionId> {
        self.transactions.begin(object_id).await
    }

    pub fn queue(&self, id: TransactionId, intent: Intent) -> Result<usize> {
        self.transactions.queue(id, intent)
    }

    pub async fn commit(&self, id: TransactionId) -> Result<Vec<IntentOutcome>> {
        self.commit_inner(id, None).await
    }

    pub async fn commit_with_cancel(&self, id: TransactionId, cancel: &CancelToken) -> Result<Vec<IntentOutcome>> {
        self.commit_inner(id, Some(cancel)).await
    }

    /// The commit runs on its own task, so a caller that stops waiting does
    /// not strand the transaction in `committing`: it still finishes, and a
    /// failure is still rolled back.
    async fn commit_inner(&self, id: TransactionId, cancel: Option<&CancelToken>) -> Result<Vec<IntentOutcome>> {
        let transactions = self.transactions.clone();
        let pipeline = self.pipeline.clone();
        let cancel = cancel.cloned();
        let task = async move {
            let result = transactions
                .commit(id, cancel.as_ref(), |object_id, intents| {
                    let pipeline = pipeline.clone();
                    let cancel = cancel.clone();
                    async move { pipeline.run_atomic(&object_id, intents, cancel.as_ref()).await }
                })
                .await;
            if result.is_err() {
                // The snapshot restore replaced the object underneath the cache.
                if let Some(info) = transactions.info(id) {
                    if info.status == TransactionStatus::RolledBack {
                        pipeline.executor().reset_object(&info.object_id);
                    }
                }
            }
            result
        };
        #[cfg(feature = "tracing")]
        let task = tracing::Instrument::in_current_span(task);
        tokio::spawn(task)
            .await
            .unwrap_or_else(|e| Err(GateError::Backend(format!("commit task failed: {e}"))))
    }

    pub fn rollback(&self, id: TransactionId) -> Result<()> {
        self.transactions.rollback(id)
    }

    pub fn transaction_status(&self, id: TransactionId) -> Option<TransactionStatus> {
        self.transactions.status(id)
    }

    pub fn transaction(&self, id: TransactionId) -> Option<TransactionInfo> {
        self.transactions.info(id)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn rate_limiter_stats(&self) -> RateLimiterStats {
        self.limiter.stats()
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    /// Backend requests issued so far, retries included.
    pub fn requests_sent(&self) -> u64 {
        self.pipeline.executor().dispatcher().requests_sent()
    }

    /// Batch windows flushed so far.
    pub fn windows_flushed(&self) -> u64 {
        self.window.flushes()
    }

    pub fn conflict_version(&self, object_id: &str, range: &GridRange) -> Option<ConflictVersion> {
        self.conflicts.get(object_id, range)
    }

    pub fn conflict_versions(&self, object_id: &str) -> Vec<(GridRange, ConflictVersion)> {
        self.conflicts.for_object(object_id)
    }

    /// Ranges currently cached for `object_id`.
    pub fn cached_ranges(&self, object_id: &str) -> Vec<GridRange> {
        self.cache.ranges(object_id)
    }

    /// Flush pending intents and stop the window task. Later submissions fail
    /// with [`GateError::Closed`](crate::GateError::Closed).
    pub async fn shutdown(&self) {
        self.window.shutdown().await;
    }
}
