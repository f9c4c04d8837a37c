//! In-flight call deduplication.
//!
//! A [`DedupKey`] is the SHA-256 of the call's canonical JSON, which covers the
//! object id, the call kind and the full payload. While a call with a given key
//! is running, identical calls attach to its shared future instead of issuing a
//! second request. Successful results stay attachable for a short window after
//! completion; failures are never replayed.

use crate::backend::{BackendCall, BackendResponse};
use crate::error::GateError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub type CallResult = Result<BackendResponse, GateError>;
type SharedCall = Shared<BoxFuture<'static, CallResult>>;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey([u8; 32]);

impl DedupKey {
    /// Key for `call`, or `None` when the call cannot be canonicalized.
    pub fn of(call: &BackendCall) -> Option<Self> {
        let canonical = serde_json::to_vec(call).ok()?;
        Some(Self(Sha256::digest(&canonical).into()))
    }
}

impl fmt::Debug for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DedupKey({})", &hex::encode(self.0)[..12])
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

enum Existing {
    Running(SharedCall, u64),
    Finished(CallResult),
    Expired,
}

enum Slot {
    InFlight {
        object_id: String,
        generation: u64,
        call: SharedCall,
    },
    Done {
        object_id: String,
        result: CallResult,
        completed_at: Instant,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    /// Calls that actually ran.
    pub dispatched: u64,
    /// Calls answered by attaching to another call.
    pub coalesced: u64,
    pub tracked: usize,
}

pub struct Deduplicator {
    slots: DashMap<DedupKey, Slot>,
    completed_ttl: Duration,
    generation: AtomicU64,
    dispatched: AtomicU64,
    coalesced: AtomicU64,
}

impl fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deduplicator")
            .field("tracked", &self.slots.len())
            .field("completed_ttl", &self.completed_ttl)
            .finish()
    }
}

/// Removes an in-flight slot whose owner went away before completion, so later
/// callers start a fresh call instead of attaching to an abandoned one.
struct OwnerGuard<'a> {
    slots: &'a DashMap<DedupKey, Slot>,
    key: DedupKey,
    generation: u64,
    armed: bool,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slots.remove_if(&self.key, |_, slot| {
                matches!(slot, Slot::InFlight { generation, .. } if *generation == self.generation)
            });
        }
    }
}

impl Deduplicator {
    pub fn new(completed_ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            completed_ttl,
            generation: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Run `start()` unless an identical call is in flight or, when
    /// `reuse_completed` is set, finished within the completion window. In
    /// either case that call's result is shared.
    pub async fn run<F>(
        &self,
        key: DedupKey,
        object_id: &str,
        reuse_completed: bool,
        start: F,
    ) -> CallResult
    where
        F: FnOnce() -> BoxFuture<'static, CallResult>,
    {
        self.purge_expired();

        let (call, generation, owner) = match self.slots.entry(key) {
            Entry::Occupied(mut occupied) => {
                let found = match occupied.get() {
                    Slot::InFlight {
                        generation, call, ..
                    } => Existing::Running(call.clone(), *generation),
                    Slot::Done {
                        result,
                        completed_at,
                        ..
                    } if reuse_completed && completed_at.elapsed() < self.completed_ttl => {
                        Existing::Finished(result.clone())
                    }
                    Slot::Done { .. } => Existing::Expired,
                };
                match found {
                    Existing::Running(call, generation) => {
                        self.coalesced.fetch_add(1, Ordering::Relaxed);
                        (call, generation, false)
                    }
                    Existing::Finished(result) => {
                        self.coalesced.fetch_add(1, Ordering::Relaxed);
                        return result;
                    }
                    Existing::Expired => {
                        let (slot, call, generation) = self.launch(object_id, start);
                        occupied.insert(slot);
                        (call, generation, true)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let (slot, call, generation) = self.launch(object_id, start);
                vacant.insert(slot);
                (call, generation, true)
            }
        };

        let mut guard = OwnerGuard {
            slots: &self.slots,
            key,
            generation,
            armed: owner,
        };
        let result = call.await;
        guard.armed = false;

        // A slot forgotten while the call ran, or replaced by a newer call,
        // no longer belongs to this result.
        let current =
            |slot: &Slot| matches!(slot, Slot::InFlight { generation: g, .. } if *g == generation);
        if result.is_ok() {
            if let Some(mut slot) = self.slots.get_mut(&key) {
                if current(&slot) {
                    *slot = Slot::Done {
                        object_id: object_id.to_string(),
                        result: result.clone(),
                        completed_at: Instant::now(),
                    };
                }
            }
        } else {
            self.slots.remove_if(&key, |_, slot| current(slot));
        }
        result
    }

    fn launch<F>(&self, object_id: &str, start: F) -> (Slot, SharedCall, u64)
    where
        F: FnOnce() -> BoxFuture<'static, CallResult>,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let call = start().shared();
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        (
            Slot::InFlight {
                object_id: object_id.to_string(),
                generation,
                call: call.clone(),
            },
            call,
            generation,
        )
    }

    fn purge_expired(&self) {
        let ttl = self.completed_ttl;
        self.slots.retain(|_, slot| match slot {
            Slot::InFlight { .. } => true,
            Slot::Done { completed_at, .. } => completed_at.elapsed() < ttl,
        });
    }

    /// Drop every slot for `object_id` so calls issued after a mutation reach
    /// the backend. Calls still running finish for the callers already
    /// attached, but their results are not kept.
    pub fn forget_object(&self, object_id: &str) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            let owner = match slot {
                Slot::InFlight { object_id: o, .. } | Slot::Done { object_id: o, .. } => o.as_str(),
            };
            owner != object_id
        });
        before - self.slots.len()
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            tracked: self.slots.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReadRequest;
    use sheetgate_common::{GridRange, RenderMode};
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn read_call(col: u32) -> BackendCall {
        BackendCall::BatchGet {
            object_id: "obj".into(),
            ranges: vec![ReadRequest {
                range: GridRange::cell(0, 0, col),
                render: RenderMode::Formatted,
            }],
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> BoxFuture<'static, CallResult> {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(BackendResponse::Updated(vec![1]))
        }
        .boxed()
    }

    #[test]
    fn keys_cover_payload() {
        assert_eq!(DedupKey::of(&read_call(1)), DedupKey::of(&read_call(1)));
        assert_ne!(DedupKey::of(&read_call(1)), DedupKey::of(&read_call(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_calls_share_one_dispatch() {
        let dedup = Deduplicator::new(Duration::from_secs(3));
        let key = DedupKey::of(&read_call(0)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (a, b) = tokio::join!(
            dedup.run(key, "obj", true, || counting(&counter)),
            dedup.run(key, "obj", true, || counting(&counter))
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
        let stats = dedup.stats();
        assert_eq!((stats.dispatched, stats.coalesced), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_results_expire() {
        let dedup = Deduplicator::new(Duration::from_secs(3));
        let key = DedupKey::of(&read_call(0)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        dedup.run(key, "obj", true, || counting(&counter)).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        dedup.run(key, "obj", true, || counting(&counter)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        tokio::time::advance(Duration::from_secs(3)).await;
        dedup.run(key, "obj", true, || counting(&counter)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_forgets_finished_results() {
        let dedup = Deduplicator::new(Duration::from_secs(3));
        let key = DedupKey::of(&read_call(0)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        dedup.run(key, "obj", true, || counting(&counter)).await.unwrap();
        assert_eq!(dedup.forget_object("other"), 0);
        assert_eq!(dedup.forget_object("obj"), 1);
        dedup.run(key, "obj", true, || counting(&counter)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn results_of_calls_overlapping_a_mutation_are_not_kept() {
        let dedup = Deduplicator::new(Duration::from_secs(3));
        let key = DedupKey::of(&read_call(0)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let forget = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            dedup.forget_object("obj")
        };
        let (first, forgotten) = tokio::join!(dedup.run(key, "obj", true, || counting(&counter)), forget);
        first.unwrap();
        assert_eq!(forgotten, 1);
        assert_eq!(dedup.stats().tracked, 0);
        dedup.run(key, "obj", true, || counting(&counter)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_not_replayed() {
        let dedup = Deduplicator::new(Duration::from_secs(3));
        let key = DedupKey::of(&read_call(0)).unwrap();
        let failing = || {
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err::<BackendResponse, _>(GateError::Backend("blip".into()))
            }
            .boxed()
        };
        assert!(dedup.run(key, "obj", true, failing).await.is_err());
        assert_eq!(dedup.stats().tracked, 0);
        let counter = Arc::new(AtomicUsize::new(0));
        dedup.run(key, "obj", true, || counting(&counter)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_runs_skip_finished_results() {
        let dedup = Deduplicator::new(Duration::from_secs(3));
        let key = DedupKey::of(&read_call(0)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        dedup.run(key, "obj", true, || counting(&counter)).await.unwrap();
        dedup.run(key, "obj", false, || counting(&counter)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(dedup.stats().coalesced, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_owner_frees_the_slot() {
        let dedup = Deduplicator::new(Duration::from_secs(3));
        let key = DedupKey::of(&read_call(0)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let _ = tokio::time::timeout(
            Duration::from_millis(10),
            dedup.run(key, "obj", true, || counting(&counter)),
        )
        .await;
        dedup.run(key, "obj", true, || counting(&counter)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
