use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sheetgate_common::{GridRange, SheetId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Sheet metadata plus its first row, as fetched once per batch window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetInfo {
    pub sheet_id: SheetId,
    pub title: String,
    pub row_count: u32,
    pub col_count: u32,
    /// Rendered values of row 0, used for header matching.
    #[serde(default)]
    pub header_row: Vec<String>,
}

impl SheetInfo {
    pub fn extent(&self) -> GridRange {
        GridRange::whole_sheet(self.sheet_id, self.row_count, self.col_count)
    }

    pub fn cell_count(&self) -> u64 {
        u64::from(self.row_count) * u64::from(self.col_count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedRangeDef {
    pub name: String,
    pub range: GridRange,
}

/// Point-in-time view of one backend object's structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveStructure {
    pub object_id: String,
    pub title: String,
    pub sheets: Vec<SheetInfo>,
    #[serde(default)]
    pub named_ranges: Vec<NamedRangeDef>,
}

impl LiveStructure {
    pub fn sheet_by_title(&self, title: &str) -> Option<&SheetInfo> {
        self.sheets
            .iter()
            .find(|s| s.title == title)
            .or_else(|| {
                self.sheets
                    .iter()
                    .find(|s| s.title.eq_ignore_ascii_case(title))
            })
    }

    pub fn sheet(&self, sheet_id: SheetId) -> Option<&SheetInfo> {
        self.sheets.iter().find(|s| s.sheet_id == sheet_id)
    }

    pub fn named_range(&self, name: &str) -> Option<&NamedRangeDef> {
        self.named_ranges.iter().find(|n| n.name == name)
    }

    pub fn total_cells(&self) -> u64 {
        self.sheets.iter().map(SheetInfo::cell_count).sum()
    }
}

/// Per-object structure snapshots with a short TTL, so one batch window costs
/// at most one metadata fetch per object.
///
/// Fetches are stamped with the object's invalidation epoch taken before the
/// request went out; a fetch that overlapped an invalidation is not stored.
#[derive(Debug)]
pub struct StructureCache {
    entries: DashMap<String, (Arc<LiveStructure>, Instant)>,
    epochs: DashMap<String, u64>,
    ttl: Duration,
}

impl StructureCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            epochs: DashMap::new(),
            ttl,
        }
    }

    pub fn epoch(&self, object_id: &str) -> u64 {
        self.epochs.get(object_id).map(|e| *e).unwrap_or(0)
    }

    pub fn get(&self, object_id: &str) -> Option<Arc<LiveStructure>> {
        let entry = self.entries.get(object_id)?;
        let (structure, fetched_at) = entry.value();
        (fetched_at.elapsed() < self.ttl).then(|| structure.clone())
    }

    /// Store `structure` if `epoch` is still current for its object.
    pub fn insert(&self, structure: Arc<LiveStructure>, epoch: u64) -> bool {
        let slot = self.entries.entry(structure.object_id.clone());
        if self.epoch(&structure.object_id) != epoch {
            return false;
        }
        slot.insert((structure, Instant::now()));
        true
    }

    pub fn invalidate(&self, object_id: &str) {
        *self.epochs.entry(object_id.to_string()).or_insert(0) += 1;
        self.entries.remove(object_id);
    }
}
