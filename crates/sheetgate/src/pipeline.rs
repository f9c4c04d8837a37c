//! The path every intent takes: structure, resolution, policy, cache,
//! compilation and execution.
//!
//! The batch window feeds [`Pipeline::run`] with everything it collected; a
//! commit feeds [`Pipeline::run_atomic`] with a transaction's intents. Both
//! share the same preparation step so a dry run or a stale precondition never
//! reaches the compiler.

use crate::backend::ReadRequest;
use crate::cache::RangeCache;
use crate::cancel::CancelToken;
use crate::compiler::{BackendBatchRequest, BatchCompiler, QueuedIntent, StructureSet};
use crate::config::GateConfig;
use crate::diff::DiffEngine;
use crate::error::{GateError, Result};
use crate::executor::{BatchExecutor, IntentOutcome};
use crate::intent::{Intent, IntentOp};
use crate::policy::{PolicyContext, PolicyDecision, PolicyEnforcer};
use crate::resolver::RangeResolver;
use crate::structure::LiveStructure;
use futures::future::join_all;
use rustc_hash::{FxHashMap, FxHashSet};
use sheetgate_common::{Grid, GridRange, RenderMode};
use std::sync::Arc;

/// Result of preparing one intent.
enum Prepared {
    /// Answered without a backend mutation (dry run or cache hit).
    Done(IntentOutcome),
    Queued(QueuedIntent),
}

#[derive(Debug)]
pub struct Pipeline {
    executor: BatchExecutor,
    compiler: BatchCompiler,
    policy: PolicyEnforcer,
    resolver: RangeResolver,
    cache: Arc<RangeCache>,
}

impl Pipeline {
    pub fn new(executor: BatchExecutor, cache: Arc<RangeCache>, config: &GateConfig) -> Self {
        let resolver = RangeResolver::new(config.resolver.duplicate_headers);
        let diff = DiffEngine::new(config.diff.clone());
        Self {
            executor,
            compiler: BatchCompiler::new(resolver, diff.clone()),
            policy: PolicyEnforcer::new(diff),
            resolver,
            cache,
        }
    }

    pub fn executor(&self) -> &BatchExecutor {
        &self.executor
    }

    async fn load_structures(
        &self,
        object_ids: &[String],
        cancel: Option<&CancelToken>,
    ) -> (StructureSet, FxHashMap<String, GateError>) {
        let mut structures = StructureSet::default();
        let mut failures = FxHashMap::default();
        for object_id in object_ids.iter().map(String::as_str) {
            if structures.contains_key(object_id) || failures.contains_key(object_id) {
                continue;
            }
            match self.executor.structure(object_id, cancel).await {
                Ok(s) => {
                    structures.insert(object_id.to_string(), s);
                }
                Err(e) => {
                    failures.insert(object_id.to_string(), e);
                }
            }
        }
        (structures, failures)
    }

    /// Resolve, check and, for reads, try the cache.
    async fn prepare(
        &self,
        seq: u64,
        intent: Intent,
        structure: &LiveStructure,
        use_cache: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<Prepared> {
        let object_id = intent.object_id.as_str();
        let target = match &intent.op {
            IntentOp::AddSheet { .. } => None,
            IntentOp::AppendRows { rows } => Some(self.resolver.resolve_append(
                object_id,
                &intent.range,
                structure,
                rows.height() as u32,
                rows.width() as u32,
                0,
            )?),
            _ => Some(self.resolver.resolve(object_id, &intent.range, structure)?),
        };

        let mut ctx = PolicyContext {
            structure,
            target,
            current: None,
        };
        let wants_checksum = intent
            .safety
            .expected_state
            .as_ref()
            .is_some_and(|e| e.checksum.is_some());
        let read = if wants_checksum {
            target
        } else if intent.safety.dry_run {
            self.policy.plan(&intent, &ctx).read_range
        } else {
            None
        };
        let current = match read {
            Some(range) => self.fetch_current(object_id, range, cancel).await?,
            None => None,
        };
        ctx.current = current.as_ref();

        match self.policy.check(&intent, &ctx)? {
            PolicyDecision::Preview(preview) => return Ok(Prepared::Done(IntentOutcome::Preview(preview))),
            PolicyDecision::Allow => {}
        }

        if let (IntentOp::ReadValues { render }, Some(range), true) = (&intent.op, target, use_cache) {
            if let Some(values) = self.cache.get(object_id, &range, *render) {
                return Ok(Prepared::Done(IntentOutcome::Read {
                    range,
                    values,
                    from_cache: true,
                }));
            }
        }

        let resolved = match intent.op {
            // Appends are placed again at compile time, below earlier appends.
            IntentOp::AppendRows { .. } => None,
            _ => target,
        };
        Ok(Prepared::Queued(QueuedIntent {
            seq,
            intent,
            resolved,
        }))
    }

    /// Fresh contents of `range`, bypassing the cache.
    async fn fetch_current(
        &self,
        object_id: &str,
        range: GridRange,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<Grid>> {
        let request = ReadRequest {
            range,
            render: RenderMode::Formatted,
        };
        let epoch = self.executor.read_epoch(object_id);
        let ranges = self
            .executor
            .dispatcher()
            .read_fresh(object_id, vec![request.clone()], cancel)
            .await?;
        Ok(ranges.into_iter().next().map(|vr| {
            self.executor.absorb_read(object_id, &request, &vr, epoch);
            vr.values
        }))
    }

    /// Run a window's worth of independent intents. Each intent gets its own
    /// result; a failed backend call fails every intent compiled into calls
    /// for the same object, and nothing else.
    pub async fn run(
        &self,
        items: Vec<(u64, Intent)>,
        cancel: Option<&CancelToken>,
    ) -> Vec<(u64, Result<IntentOutcome>)> {
        let mut items = items;
        items.sort_by_key(|(seq, _)| *seq);
        let object_ids: Vec<String> = items.iter().map(|(_, i)| i.object_id.clone()).collect();
        let (structures, failures) = self.load_structures(&object_ids, cancel).await;

        let mut results = Vec::with_capacity(items.len());
        let mut queued = Vec::new();
        let mut dirty: FxHashSet<String> = FxHashSet::default();
        for (seq, intent) in items {
            if let Some(err) = failures.get(&intent.object_id) {
                results.push((seq, Err(err.clone())));
                continue;
            }
            let Some(structure) = structures.get(&intent.object_id) else {
                let err = GateError::Backend(format!("no structure loaded for {}", intent.object_id));
                results.push((seq, Err(err)));
                continue;
            };
            // A read queued behind a mutation of the same object must not be
            // answered from values that mutation is about to replace.
            let use_cache = !dirty.contains(&intent.object_id);
            if !intent.op.is_read() && !intent.safety.dry_run {
                dirty.insert(intent.object_id.clone());
            }
            match self.prepare(seq, intent, structure, use_cache, cancel).await {
                Ok(Prepared::Done(outcome)) => results.push((seq, Ok(outcome))),
                Ok(Prepared::Queued(q)) => queued.push(q),
                Err(e) => results.push((seq, Err(e))),
            }
        }
        if queued.is_empty() {
            return results;
        }

        let batch = self.compiler.compile(&queued, &structures);
        let rejected: FxHashSet<u64> = batch.rejected.iter().map(|(seq, _)| *seq).collect();
        results.extend(batch.rejected.iter().map(|(seq, e)| (*seq, Err(e.clone()))));

        let intents: FxHashMap<u64, &Intent> = queued.iter().map(|q| (q.seq, &q.intent)).collect();
        let per_object = split_by_object(&batch);
        let executions = per_object.iter().map(|(_, sub)| {
            self.executor.execute(sub, &intents, &structures, cancel)
        });
        let executed = join_all(executions).await;

        let mut outcomes: FxHashMap<u64, Result<IntentOutcome>> = FxHashMap::default();
        for ((object_id, _), result) in per_object.iter().zip(executed) {
            let seqs = queued
                .iter()
                .filter(|q| q.intent.object_id == *object_id && !rejected.contains(&q.seq))
                .map(|q| q.seq);
            match result {
                Ok(mut map) => {
                    for seq in seqs {
                        outcomes.insert(seq, map.remove(&seq).ok_or_else(|| no_outcome(seq)));
                    }
                }
                Err(e) => {
                    for seq in seqs {
                        outcomes.insert(seq, Err(e.clone()));
                    }
                }
            }
        }
        for q in &queued {
            if rejected.contains(&q.seq) {
                continue;
            }
            let outcome = outcomes.remove(&q.seq).unwrap_or_else(|| Err(no_outcome(q.seq)));
            results.push((q.seq, outcome));
        }
        results.sort_by_key(|(seq, _)| *seq);
        results
    }

    /// Run `intents` against one object as a single unit: the first error of
    /// any kind fails the whole group.
    pub async fn run_atomic(
        &self,
        object_id: &str,
        intents: Vec<Intent>,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<IntentOutcome>> {
        let structure = self.executor.structure(object_id, cancel).await?;
        let mut done: FxHashMap<u64, IntentOutcome> = FxHashMap::default();
        let mut queued = Vec::new();
        let mut dirty = false;
        let count = intents.len() as u64;
        for (seq, intent) in (0u64..).zip(intents) {
            if intent.object_id != object_id {
                return Err(GateError::Backend(format!(
                    "intent for {} in a unit bound to {object_id}",
                    intent.object_id
                )));
            }
            let use_cache = !dirty;
            dirty |= !intent.op.is_read() && !intent.safety.dry_run;
            match self.prepare(seq, intent, &structure, use_cache, cancel).await? {
                Prepared::Done(outcome) => {
                    done.insert(seq, outcome);
                }
                Prepared::Queued(q) => queued.push(q),
            }
        }

        if !queued.is_empty() {
            let mut structures = StructureSet::default();
            structures.insert(object_id.to_string(), structure);
            let batch = self.compiler.compile(&queued, &structures);
            if let Some((_, err)) = batch.rejected.first() {
                return Err(err.clone());
            }
            let intents: FxHashMap<u64, &Intent> =
                queued.iter().map(|q| (q.seq, &q.intent)).collect();
            let executed = self
                .executor
                .execute(&batch, &intents, &structures, cancel)
                .await?;
            done.extend(executed);
        }

        (0..count)
            .map(|seq| done.remove(&seq).ok_or_else(|| no_outcome(seq)))
            .collect()
    }
}

fn no_outcome(seq: u64) -> GateError {
    GateError::Backend(format!("no response covered intent #{seq}"))
}

/// One sub-batch per object, in first-call order. Objects fail independently.
fn split_by_object(batch: &BackendBatchRequest) -> Vec<(String, BackendBatchRequest)> {
    batch
        .object_ids()
        .into_iter()
        .map(|object_id| {
            let sub = BackendBatchRequest {
                calls: batch
                    .calls
                    .iter()
                    .filter(|c| c.call.object_id() == object_id)
                    .cloned()
                    .collect(),
                resolved: batch
                    .resolved
                    .iter()
                    .filter(|(_, r)| r.object_id == object_id)
                    .map(|(seq, r)| (*seq, r.clone()))
                    .collect(),
                rejected: Vec::new(),
            };
            (object_id.to_string(), sub)
        })
        .collect()
}
