//! All-or-nothing intent groups emulated with snapshots.
//!
//! The backend has no multi-call transaction primitive. A snapshot is taken at
//! `begin`; `commit` compiles and dispatches every queued intent as one unit and
//! restores the snapshot if anything fails, including cancellation.

use crate::backend::{SnapshotId, SnapshotService};
use crate::cancel::CancelToken;
use crate::error::{GateError, Result};
use crate::executor::IntentOutcome;
use crate::intent::Intent;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Open,
    Committing,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::RolledBack)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionStatus::Open => "open",
            TransactionStatus::Committing => "committing",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RolledBack => "rolled_back",
        })
    }
}

#[derive(Debug)]
struct TransactionRecord {
    object_id: String,
    snapshot: SnapshotId,
    status: TransactionStatus,
    intents: Vec<Intent>,
    queued: usize,
    opened_at: DateTime<Utc>,
    finished_at: Option<Instant>,
    failure: Option<String>,
}

/// Read-only view of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub object_id: String,
    pub status: TransactionStatus,
    pub queued: usize,
    pub snapshot: SnapshotId,
    pub opened_at: DateTime<Utc>,
    /// Why a commit was rolled back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

pub struct TransactionManager {
    snapshots: Arc<dyn SnapshotService>,
    records: DashMap<TransactionId, TransactionRecord>,
    /// Object id to its open or committing transaction.
    live: DashMap<String, TransactionId>,
    next_id: AtomicU64,
    /// How long finished records stay queryable.
    retention: Duration,
}

/// Releases an object claimed by `begin` if the snapshot never completes,
/// including when the `begin` future is dropped mid-await.
struct LiveClaim<'a> {
    live: &'a DashMap<String, TransactionId>,
    object_id: &'a str,
    id: TransactionId,
    armed: bool,
}

impl Drop for LiveClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.live.remove_if(self.object_id, |_, live| *live == self.id);
        }
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl TransactionManager {
    pub fn new(snapshots: Arc<dyn SnapshotService>, retention: Duration) -> Self {
        Self {
            snapshots,
            records: DashMap::new(),
            live: DashMap::new(),
            next_id: AtomicU64::new(1),
            retention,
        }
    }

    /// Open a transaction on `object_id`, snapshotting it first.
    ///
    /// Only one live transaction per object is allowed; a second `begin` fails
    /// until the first reaches a terminal state. Finished records older than
    /// the retention window are pruned here.
    pub async fn begin(&self, object_id: &str) -> Result<TransactionId> {
        self.prune_finished();
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.live.entry(object_id.to_string()) {
            Entry::Occupied(existing) => {
                let other = *existing.get();
                return Err(GateError::TransactionState {
                    id: other,
                    status: self.status(other).unwrap_or(TransactionStatus::Open),
                    action: "begin another transaction on the same object",
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        let mut claim = LiveClaim {
            live: &self.live,
            object_id,
            id,
            armed: true,
        };
        let snapshot = self
            .snapshots
            .create_snapshot(object_id)
            .await
            .map_err(|e| GateError::Snapshot(e.to_string()))?;
        claim.armed = false;
        self.records.insert(
            id,
            TransactionRecord {
                object_id: object_id.to_string(),
                snapshot,
                status: TransactionStatus::Open,
                intents: Vec::new(),
                queued: 0,
                opened_at: Utc::now(),
                finished_at: None,
                failure: None,
            },
        );
        #[cfg(feature = "tracing")]
        tracing::debug!(%id, object_id, "transaction opened");
        Ok(id)
    }

    /// Append `intent`; returns the number of queued intents.
    pub fn queue(&self, id: TransactionId, intent: Intent) -> Result<usize> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or(GateError::UnknownTransaction(id))?;
        if record.status != TransactionStatus::Open {
            return Err(GateError::TransactionState {
                id,
                status: record.status,
                action: "queue",
            });
        }
        if intent.object_id != record.object_id {
            return Err(GateError::ObjectMismatch {
                id,
                expected: record.object_id.clone(),
                found: intent.object_id,
            });
        }
        record.intents.push(intent);
        record.queued += 1;
        Ok(record.queued)
    }

    /// Run the queued intents through `run` as one unit.
    ///
    /// Any error from `run`, or `cancel` firing first, restores the snapshot and
    /// ends in `rolled_back`. A failed restore is reported as
    /// [`GateError::TransactionRollbackFailure`] carrying both causes.
    pub async fn commit<F, Fut>(
        &self,
        id: TransactionId,
        cancel: Option<&CancelToken>,
        run: F,
    ) -> Result<Vec<IntentOutcome>>
    where
        F: FnOnce(String, Vec<Intent>) -> Fut,
        Fut: Future<Output = Result<Vec<IntentOutcome>>>,
    {
        let (object_id, snapshot, intents) = {
            let mut record = self
                .records
                .get_mut(&id)
                .ok_or(GateError::UnknownTransaction(id))?;
            if record.status != TransactionStatus::Open {
                return Err(GateError::TransactionState {
                    id,
                    status: record.status,
                    action: "commit",
                });
            }
            record.status = TransactionStatus::Committing;
            (
                record.object_id.clone(),
                record.snapshot.clone(),
                std::mem::take(&mut record.intents),
            )
        };

        #[cfg(feature = "tracing")]
        let span = tracing::info_span!(
            "commit_transaction",
            %id,
            object_id = object_id.as_str(),
            intents = intents.len()
        );

        let work = run(object_id, intents);
        #[cfg(feature = "tracing")]
        let work = tracing::Instrument::instrument(work, span);
        let result = match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(GateError::Cancelled),
                    result = work => result,
                }
            }
            None => work.await,
        };

        match result {
            Ok(outcomes) => {
                self.finish(id, TransactionStatus::Committed, None);
                Ok(outcomes)
            }
            Err(original) => {
                let restored = self.snapshots.restore(&snapshot).await;
                self.finish(id, TransactionStatus::RolledBack, Some(original.to_string()));
                match restored {
                    Ok(()) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(%id, error = %original, "transaction rolled back");
                        Err(original)
                    }
                    Err(rollback) => {
                        #[cfg(feature = "tracing")]
                        tracing::error!(
                            %id,
                            error = %original,
                            rollback = %rollback,
                            "snapshot restore failed"
                        );
                        Err(GateError::TransactionRollbackFailure {
                            transaction_id: id,
                            original: Box::new(original),
                            rollback: rollback.to_string(),
                        })
                    }
                }
            }
        }
    }

    /// Abandon an open transaction. Nothing has been dispatched yet, so the
    /// queued intents are discarded without touching the backend.
    pub fn rollback(&self, id: TransactionId) -> Result<()> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or(GateError::UnknownTransaction(id))?;
        if record.status != TransactionStatus::Open {
            return Err(GateError::TransactionState {
                id,
                status: record.status,
                action: "roll back",
            });
        }
        record.intents.clear();
        record.status = TransactionStatus::RolledBack;
        record.finished_at = Some(Instant::now());
        self.live.remove_if(&record.object_id, |_, live| *live == id);
        Ok(())
    }

    fn finish(&self, id: TransactionId, status: TransactionStatus, failure: Option<String>) {
        if let Some(mut record) = self.records.get_mut(&id) {
            record.status = status;
            record.failure = failure;
            record.finished_at = Some(Instant::now());
            self.live.remove_if(&record.object_id, |_, live| *live == id);
        }
    }

    pub fn status(&self, id: TransactionId) -> Option<TransactionStatus> {
        self.records.get(&id).map(|r| r.status)
    }

    pub fn info(&self, id: TransactionId) -> Option<TransactionInfo> {
        self.records.get(&id).map(|r| TransactionInfo {
            id,
            object_id: r.object_id.clone(),
            status: r.status,
            queued: r.queued,
            snapshot: r.snapshot.clone(),
            opened_at: r.opened_at,
            failure: r.failure.clone(),
        })
    }

    /// Drop records of transactions finished longer ago than the retention
    /// window. Returns how many were removed.
    pub fn prune_finished(&self) -> usize {
        let retention = self.retention;
        let before = self.records.len();
        self.records
            .retain(|_, r| r.finished_at.is_none_or(|at| at.elapsed() < retention));
        before - self.records.len()
    }

    /// Records currently held, finished ones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SnapshotError;
    use crate::intent::RangeSpec;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Snapshots {
        restored: Mutex<Vec<SnapshotId>>,
        fail_restore: bool,
    }

    #[async_trait]
    impl SnapshotService for Snapshots {
        async fn create_snapshot(&self, object_id: &str) -> Result<SnapshotId, SnapshotError> {
            Ok(SnapshotId(format!("snap-{object_id}")))
        }

        async fn restore(&self, snapshot: &SnapshotId) -> Result<(), SnapshotError> {
            if self.fail_restore {
                return Err(SnapshotError("storage offline".into()));
            }
            self.restored.lock().push(snapshot.clone());
            Ok(())
        }
    }

    fn read(object: &str) -> Intent {
        Intent::read(object, RangeSpec::a1("A1"))
    }

    fn manager(snapshots: Arc<dyn SnapshotService>) -> TransactionManager {
        TransactionManager::new(snapshots, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn commit_success_is_terminal() {
        let tm = manager(Arc::new(Snapshots::default()));
        let id = tm.begin("obj").await.unwrap();
        assert_eq!(tm.queue(id, read("obj")).unwrap(), 1);
        assert_eq!(tm.queue(id, read("obj")).unwrap(), 2);
        let out = tm
            .commit(id, None, |object_id, intents| async move {
                assert_eq!(object_id, "obj");
                assert_eq!(intents.len(), 2);
                Ok(Vec::new())
            })
            .await
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(tm.status(id), Some(TransactionStatus::Committed));
        assert!(matches!(
            tm.queue(id, read("obj")),
            Err(GateError::TransactionState { action: "queue", .. })
        ));
        assert!(tm.rollback(id).is_err());
    }

    #[tokio::test]
    async fn failure_restores_snapshot() {
        let snapshots = Arc::new(Snapshots::default());
        let tm = manager(snapshots.clone());
        let id = tm.begin("obj").await.unwrap();
        let err = tm
            .commit(id, None, |_, _| async { Err(GateError::Backend("boom".into())) })
            .await
            .unwrap_err();
        assert_eq!(err, GateError::Backend("boom".into()));
        assert_eq!(tm.status(id), Some(TransactionStatus::RolledBack));
        assert_eq!(snapshots.restored.lock().as_slice(), &[SnapshotId("snap-obj".into())]);
        assert!(tm.info(id).unwrap().failure.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn restore_failure_is_compound() {
        let tm = manager(Arc::new(Snapshots {
            fail_restore: true,
            ..Default::default()
        }));
        let id = tm.begin("obj").await.unwrap();
        let err = tm
            .commit(id, None, |_, _| async { Err(GateError::Backend("boom".into())) })
            .await
            .unwrap_err();
        match err {
            GateError::TransactionRollbackFailure {
                transaction_id,
                original,
                rollback,
            } => {
                assert_eq!(transaction_id, id);
                assert_eq!(*original, GateError::Backend("boom".into()));
                assert!(rollback.contains("storage offline"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(tm.status(id), Some(TransactionStatus::RolledBack));
    }

    #[tokio::test]
    async fn cancellation_rolls_back() {
        let snapshots = Arc::new(Snapshots::default());
        let tm = manager(snapshots.clone());
        let id = tm.begin("obj").await.unwrap();
        let token = CancelToken::new();
        token.cancel();
        let err = tm
            .commit(id, Some(&token), |_, _| std::future::pending())
            .await
            .unwrap_err();
        assert_eq!(err, GateError::Cancelled);
        assert_eq!(tm.status(id), Some(TransactionStatus::RolledBack));
        assert_eq!(snapshots.restored.lock().len(), 1);
    }

    #[tokio::test]
    async fn one_live_transaction_per_object() {
        let tm = manager(Arc::new(Snapshots::default()));
        let first = tm.begin("obj").await.unwrap();
        assert!(tm.begin("obj").await.is_err());
        assert!(tm.begin("other").await.is_ok());
        assert!(matches!(
            tm.queue(first, read("other")),
            Err(GateError::ObjectMismatch { .. })
        ));
        tm.rollback(first).unwrap();
        assert_eq!(tm.status(first), Some(TransactionStatus::RolledBack));
        assert!(tm.begin("obj").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_records_are_pruned_after_retention() {
        let tm = manager(Arc::new(Snapshots::default()));
        let first = tm.begin("a").await.unwrap();
        tm.rollback(first).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        let open = tm.begin("b").await.unwrap();
        assert_eq!(tm.len(), 2);
        tokio::time::advance(Duration::from_secs(30)).await;
        tm.begin("c").await.unwrap();
        assert_eq!(
            tm.queue(first, read("a")),
            Err(GateError::UnknownTransaction(first))
        );
        // Open transactions are never pruned.
        assert_eq!(tm.status(open), Some(TransactionStatus::Open));
        assert_eq!(tm.len(), 2);
    }

    struct SlowSnapshots;

    #[async_trait]
    impl SnapshotService for SlowSnapshots {
        async fn create_snapshot(&self, object_id: &str) -> Result<SnapshotId, SnapshotError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(SnapshotId(format!("snap-{object_id}")))
        }

        async fn restore(&self, _snapshot: &SnapshotId) -> Result<(), SnapshotError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_begin_releases_the_object() {
        let tm = manager(Arc::new(SlowSnapshots));
        let abandoned = tokio::time::timeout(Duration::from_millis(10), tm.begin("obj")).await;
        assert!(abandoned.is_err());
        let id = tm.begin("obj").await.unwrap();
        assert_eq!(tm.status(id), Some(TransactionStatus::Open));
    }
}
