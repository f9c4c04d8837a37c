//! Dispatch and execution of compiled batches.
//!
//! [`Dispatcher`] is the single path to the network: every call is rate
//! limited, deduplicated when idempotent, retried with backoff on backend
//! throttling and abandoned on cancellation. [`BatchExecutor`] runs a compiled
//! batch call by call, keeps the cache and ConflictVersion registry in step
//! with what each call did, and maps responses back onto intents.

use crate::backend::{
    BackendCall, BackendError, BackendResponse, ReadRequest, SheetsBackend, StructuralReply,
    StructuralRequest, ValueMutation, ValueRange,
};
use crate::cache::RangeCache;
use crate::cancel::CancelToken;
use crate::compiler::{BackendBatchRequest, CallPurpose, CompiledCall, StructureSet};
use crate::config::RetryConfig;
use crate::conflict::{ConflictRegistry, ConflictVersion, checksum_grid};
use crate::dedup::{CallResult, DedupKey, Deduplicator};
use crate::diff::{DiffEngine, DiffResult, project};
use crate::error::{GateError, Result};
use crate::intent::{Intent, IntentOp};
use crate::limiter::RateLimiter;
use crate::policy::DryRunPreview;
use crate::structure::{LiveStructure, StructureCache};
use chrono::Utc;
use futures::FutureExt;
use rustc_hash::FxHashMap;
use serde::Serialize;
use sheetgate_common::{Grid, GridRange};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// What a single intent produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IntentOutcome {
    Read {
        range: GridRange,
        values: Arc<Grid>,
        from_cache: bool,
    },
    Written {
        range: GridRange,
        updated_cells: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        diff: Option<DiffResult>,
    },
    Structural {
        reply: StructuralReply,
        #[serde(skip_serializing_if = "Option::is_none")]
        diff: Option<DiffResult>,
    },
    /// Dry run: nothing was sent.
    Preview(DryRunPreview),
}

impl IntentOutcome {
    /// Cells read or written, when the outcome is tied to one range.
    pub fn range(&self) -> Option<GridRange> {
        match self {
            IntentOutcome::Read { range, .. } | IntentOutcome::Written { range, .. } => Some(*range),
            IntentOutcome::Preview(preview) => preview.target,
            IntentOutcome::Structural { .. } => None,
        }
    }

    pub fn values(&self) -> Option<&Grid> {
        match self {
            IntentOutcome::Read { values, .. } => Some(values),
            _ => None,
        }
    }

    pub fn diff(&self) -> Option<&DiffResult> {
        match self {
            IntentOutcome::Written { diff, .. } | IntentOutcome::Structural { diff, .. } => {
                diff.as_ref()
            }
            _ => None,
        }
    }
}

fn map_backend_error(err: BackendError) -> GateError {
    match err {
        BackendError::Auth(msg) => GateError::Auth(msg),
        // Throttling is handled by the retry loop before it gets here.
        BackendError::Throttled { retry_after } => GateError::BackendThrottled {
            attempts: 1,
            retry_after,
        },
        other => GateError::Backend(other.to_string()),
    }
}

/// Per-object write epochs captured before a read goes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadEpoch {
    cache: u64,
    conflicts: u64,
}

/// Limits, deduplicates, retries and sends backend calls.
#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn SheetsBackend>,
    limiter: Arc<RateLimiter>,
    dedup: Arc<Deduplicator>,
    retry: RetryConfig,
    sent: Arc<AtomicU64>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("sent", &self.sent.load(Ordering::Relaxed))
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn SheetsBackend>,
        limiter: Arc<RateLimiter>,
        dedup: Arc<Deduplicator>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            backend,
            limiter,
            dedup,
            retry,
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    /// Network requests actually issued, retries included.
    pub fn requests_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub async fn dispatch(&self, call: BackendCall, cancel: Option<&CancelToken>) -> CallResult {
        self.dispatch_with(call, cancel, true).await
    }

    async fn dispatch_with(
        &self,
        call: BackendCall,
        cancel: Option<&CancelToken>,
        reuse_completed: bool,
    ) -> CallResult {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(GateError::Cancelled);
        }
        let run = async {
            match DedupKey::of(&call).filter(|_| call.is_idempotent()) {
                Some(key) => {
                    let this = self.clone();
                    let object_id = call.object_id().to_string();
                    self.dedup
                        .run(key, &object_id, reuse_completed, move || {
                            async move { this.send_with_retry(&call).await }.boxed()
                        })
                        .await
                }
                None => self.send_with_retry(&call).await,
            }
        };
        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(GateError::Cancelled),
                    result = run => result,
                }
            }
            None => run.await,
        }
    }

    async fn send_with_retry(&self, call: &BackendCall) -> CallResult {
        let class = call.class();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.limiter.acquire(class).await?;
            self.sent.fetch_add(1, Ordering::Relaxed);

            let send = call.send(self.backend.as_ref());
            #[cfg(feature = "tracing")]
            let send = tracing::Instrument::instrument(
                send,
                tracing::debug_span!(
                    "dispatch_call",
                    kind = call.kind(),
                    object_id = call.object_id(),
                    attempt
                ),
            );

            match send.await {
                Ok(response) => return Ok(response),
                Err(BackendError::Throttled { retry_after }) => {
                    self.limiter.report_throttled(class);
                    if attempt >= self.retry.max_attempts {
                        return Err(GateError::BackendThrottled {
                            attempts: attempt,
                            retry_after,
                        });
                    }
                    tokio::time::sleep(self.retry.backoff(attempt, retry_after)).await;
                }
                Err(other) => return Err(map_backend_error(other)),
            }
        }
    }

    pub async fn fetch_structure(
        &self,
        object_id: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<Arc<LiveStructure>> {
        let call = BackendCall::FetchStructure {
            object_id: object_id.to_string(),
        };
        match self.dispatch(call, cancel).await? {
            BackendResponse::Structure(s) => Ok(s),
            other => Err(unexpected("fetch_structure", &other)),
        }
    }

    /// Read straight from the backend. May attach to an identical call still
    /// in flight, never to one that already finished.
    pub async fn read_fresh(
        &self,
        object_id: &str,
        ranges: Vec<ReadRequest>,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<ValueRange>> {
        let call = BackendCall::BatchGet {
            object_id: object_id.to_string(),
            ranges,
        };
        match self.dispatch_with(call, cancel, false).await? {
            BackendResponse::ValueRanges(v) => Ok(v),
            other => Err(unexpected("batch_get", &other)),
        }
    }
}

fn unexpected(call: &str, response: &BackendResponse) -> GateError {
    GateError::Backend(format!("unexpected response to {call}: {response:?}"))
}

/// Runs compiled batches and keeps the cache, structure cache and
/// ConflictVersion registry in step with each call.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    dispatcher: Dispatcher,
    cache: Arc<RangeCache>,
    conflicts: Arc<ConflictRegistry>,
    structures: Arc<StructureCache>,
    diff: DiffEngine,
    actor_id: Arc<str>,
}

impl BatchExecutor {
    pub fn new(
        dispatcher: Dispatcher,
        cache: Arc<RangeCache>,
        conflicts: Arc<ConflictRegistry>,
        structures: Arc<StructureCache>,
        diff: DiffEngine,
        actor_id: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            dispatcher,
            cache,
            conflicts,
            structures,
            diff,
            actor_id: actor_id.into(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Structure for `object_id`, from the structure cache when fresh.
    pub async fn structure(
        &self,
        object_id: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<Arc<LiveStructure>> {
        if let Some(s) = self.structures.get(object_id) {
            return Ok(s);
        }
        let epoch = self.structures.epoch(object_id);
        let s = self.dispatcher.fetch_structure(object_id, cancel).await?;
        self.structures.insert(s.clone(), epoch);
        Ok(s)
    }

    /// Write epochs to pass to [`BatchExecutor::absorb_read`], taken before
    /// the read is sent.
    pub fn read_epoch(&self, object_id: &str) -> ReadEpoch {
        ReadEpoch {
            cache: self.cache.write_epoch(object_id),
            conflicts: self.conflicts.epoch(object_id),
        }
    }

    /// Record values just read from the backend, unless a write to the object
    /// was applied after `epoch` was taken.
    pub fn absorb_read(
        &self,
        object_id: &str,
        request: &ReadRequest,
        vr: &ValueRange,
        epoch: ReadEpoch,
    ) {
        let stored = self.cache.put_if_unchanged(
            object_id,
            request.range,
            request.render,
            vr.values.clone(),
            epoch.cache,
        );
        if !stored {
            #[cfg(feature = "tracing")]
            tracing::debug!(object_id, range = %request.range, "read overlapped a write, not cached");
            return;
        }
        let (last_modified, modifier_id) = match &vr.revision {
            Some(rev) => (rev.modified_at, rev.modifier_id.clone()),
            None => (Utc::now(), "unknown".to_string()),
        };
        self.conflicts.record_read(
            object_id,
            request.range,
            ConflictVersion {
                last_modified,
                modifier_id,
                checksum: checksum_grid(&vr.values),
            },
            epoch.conflicts,
        );
    }

    /// Execute `batch` in order. The first failing call fails the whole batch;
    /// cache entries touched by calls that already ran stay invalidated.
    pub async fn execute(
        &self,
        batch: &BackendBatchRequest,
        intents: &FxHashMap<u64, &Intent>,
        structures: &StructureSet,
        cancel: Option<&CancelToken>,
    ) -> Result<FxHashMap<u64, IntentOutcome>> {
        let mut outcomes = FxHashMap::default();
        let mut before: FxHashMap<u64, Grid> = FxHashMap::default();

        for compiled in &batch.calls {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(GateError::Cancelled);
            }
            let object_id = compiled.call.object_id();
            let epoch = self.read_epoch(object_id);
            let response = self.dispatcher.dispatch(compiled.call.clone(), cancel).await;
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    // The backend may have applied part of a failed mutation.
                    self.invalidate_for(compiled);
                    return Err(e);
                }
            };

            match (compiled.purpose, response) {
                (CallPurpose::Read, BackendResponse::ValueRanges(ranges)) => {
                    let requests = read_requests(&compiled.call);
                    for (request, vr) in requests.iter().zip(&ranges) {
                        self.absorb_read(object_id, request, vr, epoch);
                    }
                    for m in &compiled.members {
                        if let (Some(request), Some(vr)) = (requests.get(m.item), ranges.get(m.item)) {
                            outcomes.insert(
                                m.seq,
                                IntentOutcome::Read {
                                    range: request.range,
                                    values: Arc::new(vr.values.clone()),
                                    from_cache: false,
                                },
                            );
                        }
                    }
                }
                (CallPurpose::BeforeState, BackendResponse::ValueRanges(ranges)) => {
                    let requests = read_requests(&compiled.call);
                    for (request, vr) in requests.iter().zip(&ranges) {
                        self.absorb_read(object_id, request, vr, epoch);
                    }
                    for m in &compiled.members {
                        if let Some(vr) = ranges.get(m.item) {
                            before.insert(m.seq, vr.values.clone());
                        }
                    }
                }
                (CallPurpose::Values, BackendResponse::Updated(counts)) => {
                    self.apply_values(object_id, compiled);
                    for m in &compiled.members {
                        let Some(intent) = intents.get(&m.seq) else {
                            continue;
                        };
                        let Some(range) = batch.resolved.get(&m.seq).and_then(|r| r.affected) else {
                            continue;
                        };
                        let diff = if intent.safety.capture_diff {
                            self.value_diff(intent, batch, m.seq, &before)
                        } else {
                            None
                        };
                        outcomes.insert(
                            m.seq,
                            IntentOutcome::Written {
                                range,
                                updated_cells: range_updates(compiled, m.item, &counts, &range),
                                diff,
                            },
                        );
                    }
                }
                (CallPurpose::Structure, BackendResponse::Replies(replies)) => {
                    self.apply_structure(object_id, compiled);
                    let wants_diff = compiled.seqs().any(|seq| {
                        intents.get(&seq).is_some_and(|i| i.safety.capture_diff)
                    });
                    let meta = if wants_diff {
                        self.metadata_diff(object_id, structures, cancel).await?
                    } else {
                        None
                    };
                    for m in &compiled.members {
                        let capture = intents
                            .get(&m.seq)
                            .is_some_and(|i| i.safety.capture_diff);
                        outcomes.insert(
                            m.seq,
                            IntentOutcome::Structural {
                                reply: replies.get(m.item).cloned().unwrap_or(StructuralReply::Done),
                                diff: if capture { meta.clone() } else { None },
                            },
                        );
                    }
                }
                (_, other) => return Err(unexpected(compiled.call.kind(), &other)),
            }
        }
        Ok(outcomes)
    }

    fn value_diff(
        &self,
        intent: &Intent,
        batch: &BackendBatchRequest,
        seq: u64,
        before: &FxHashMap<u64, Grid>,
    ) -> Option<DiffResult> {
        let resolved = batch.resolved.get(&seq)?;
        let anchor = resolved.affected?;
        let prior = match &intent.op {
            IntentOp::AppendRows { .. } => Grid::default(),
            _ => before.get(&seq)?.clone(),
        };
        let after = project(&intent.op, &prior)?;
        let mut result = self.diff.diff(&anchor, &prior, &after, resolved.plan.tier);
        result.truncated |= resolved.plan.truncated;
        Some(result)
    }

    async fn metadata_diff(
        &self,
        object_id: &str,
        structures: &StructureSet,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<DiffResult>> {
        let Some(before) = structures.get(object_id) else {
            return Ok(None);
        };
        let epoch = self.structures.epoch(object_id);
        let after = self.dispatcher.fetch_structure(object_id, cancel).await?;
        self.structures.insert(after.clone(), epoch);
        Ok(Some(DiffResult::metadata(
            self.diff.diff_structure(before, &after),
        )))
    }

    fn apply_values(&self, object_id: &str, compiled: &CompiledCall) {
        let BackendCall::ValuesBatchUpdate { data, .. } = &compiled.call else {
            return;
        };
        self.dispatcher.dedup.forget_object(object_id);
        let mut grew = false;
        for mutation in data {
            let range = mutation.range();
            self.cache.invalidate_overlapping(object_id, range);
            self.conflicts.forget_overlapping(object_id, range);
            match mutation {
                ValueMutation::Write { range, values } => {
                    self.conflicts.record(
                        object_id,
                        *range,
                        ConflictVersion {
                            last_modified: Utc::now(),
                            modifier_id: self.actor_id.to_string(),
                            checksum: checksum_grid(values),
                        },
                    );
                }
                ValueMutation::Append { .. } => grew = true,
                ValueMutation::Clear { .. } => {}
            }
        }
        if grew {
            self.structures.invalidate(object_id);
        }
    }

    fn apply_structure(&self, object_id: &str, compiled: &CompiledCall) {
        let BackendCall::BatchUpdate { requests, .. } = &compiled.call else {
            return;
        };
        self.dispatcher.dedup.forget_object(object_id);
        for request in requests {
            match request {
                // Number formats change rendered values in place.
                StructuralRequest::FormatCells { range, .. } => {
                    self.cache.invalidate_overlapping(object_id, range);
                }
                StructuralRequest::AddSheet { .. } => {}
                other => {
                    if let Some(sheet_id) = other.sheet_id() {
                        self.cache.invalidate_sheet(object_id, sheet_id);
                        self.conflicts.forget_overlapping(
                            object_id,
                            &GridRange::whole_sheet(sheet_id, u32::MAX, u32::MAX),
                        );
                    }
                }
            }
        }
        self.structures.invalidate(object_id);
    }

    fn invalidate_for(&self, compiled: &CompiledCall) {
        let object_id = compiled.call.object_id();
        if matches!(
            compiled.call,
            BackendCall::FetchStructure { .. } | BackendCall::BatchGet { .. }
        ) {
            return;
        }
        self.dispatcher.dedup.forget_object(object_id);
        match &compiled.call {
            BackendCall::ValuesBatchUpdate { data, .. } => {
                for m in data {
                    self.cache.invalidate_overlapping(object_id, m.range());
                    self.conflicts.forget_overlapping(object_id, m.range());
                }
                self.structures.invalidate(object_id);
            }
            BackendCall::BatchUpdate { .. } => {
                self.cache.invalidate_object(object_id);
                self.conflicts.forget_object(object_id);
                self.structures.invalidate(object_id);
            }
            BackendCall::FetchStructure { .. } | BackendCall::BatchGet { .. } => {}
        }
    }

    /// Drop expired cache entries and ConflictVersions.
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired() + self.conflicts.purge_expired()
    }

    /// Forget everything cached about `object_id` (after a snapshot restore).
    pub fn reset_object(&self, object_id: &str) {
        self.dispatcher.dedup.forget_object(object_id);
        self.cache.invalidate_object(object_id);
        self.conflicts.forget_object(object_id);
        self.structures.invalidate(object_id);
    }
}

fn read_requests(call: &BackendCall) -> &[ReadRequest] {
    match call {
        BackendCall::BatchGet { ranges, .. } => ranges,
        _ => &[],
    }
}

/// Cells updated for one intent. Coalesced items report the intent's own
/// block rather than the merged item's total.
fn range_updates(compiled: &CompiledCall, item: usize, counts: &[u64], range: &GridRange) -> u64 {
    let shared = compiled.members.iter().filter(|m| m.item == item).count() > 1;
    if shared {
        range.cell_count()
    } else {
        counts.get(item).copied().unwrap_or(0)
    }
}
