//! Snapshot service backed by copies of [`InMemorySheets`] objects.

use crate::backend::{InMemorySheets, MemoryObject};
use async_trait::async_trait;
use parking_lot::Mutex;
use sheetgate::backend::{SnapshotError, SnapshotId, SnapshotService};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub struct MemorySnapshots {
    sheets: InMemorySheets,
    stored: Arc<Mutex<HashMap<SnapshotId, MemoryObject>>>,
    next: Arc<AtomicU64>,
    restores: Arc<AtomicU64>,
    fail_create: Arc<AtomicBool>,
    fail_restore: Arc<AtomicBool>,
}

impl MemorySnapshots {
    pub fn new(sheets: InMemorySheets) -> Self {
        Self {
            sheets,
            stored: Arc::default(),
            next: Arc::new(AtomicU64::new(1)),
            restores: Arc::default(),
            fail_create: Arc::default(),
            fail_restore: Arc::default(),
        }
    }

    /// Make every `create_snapshot` fail until reset.
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make every `restore` fail until reset.
    pub fn fail_restore(&self, fail: bool) {
        self.fail_restore.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot_count(&self) -> usize {
        self.stored.lock().len()
    }

    pub fn restore_count(&self) -> u64 {
        self.restores.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotService for MemorySnapshots {
    async fn create_snapshot(&self, object_id: &str) -> Result<SnapshotId, SnapshotError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SnapshotError(format!("cannot snapshot {object_id}")));
        }
        let object = self
            .sheets
            .object(object_id)
            .ok_or_else(|| SnapshotError(format!("unknown object {object_id}")))?;
        let id = SnapshotId(format!(
            "{object_id}@{}",
            self.next.fetch_add(1, Ordering::SeqCst)
        ));
        self.stored.lock().insert(id.clone(), object);
        Ok(id)
    }

    async fn restore(&self, snapshot: &SnapshotId) -> Result<(), SnapshotError> {
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(SnapshotError(format!("restore of {snapshot} failed")));
        }
        let object = self
            .stored
            .lock()
            .get(snapshot)
            .cloned()
            .ok_or_else(|| SnapshotError(format!("unknown snapshot {snapshot}")))?;
        self.sheets.replace(object);
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::ObjectBuilder;
    use sheetgate_common::CellValue;

    #[tokio::test]
    async fn restore_puts_the_object_back() {
        let sheets = InMemorySheets::new();
        sheets.insert(ObjectBuilder::new("obj").sheet("Data", 5, 5).build());
        let snaps = MemorySnapshots::new(sheets.clone());
        let before = sheets.object("obj").unwrap();
        let id = snaps.create_snapshot("obj").await.unwrap();
        sheets.set_cell("obj", "Data", 0, 0, CellValue::Int(1));
        assert_ne!(sheets.object("obj").unwrap(), before);
        snaps.restore(&id).await.unwrap();
        assert_eq!(sheets.object("obj").unwrap(), before);
        assert_eq!(snaps.restore_count(), 1);
    }
}
