//! Tiered before/after diffs.
//!
//! Cells are compared by rendered value, so two formulas that display the same
//! result are not a change. Tier selection is a pure function of the operation
//! kind and the estimated number of affected cells:
//!
//! * structural/formatting operations get [`DiffTier::Metadata`];
//! * value operations touching at most `full_threshold_cells` get [`DiffTier::Full`];
//! * larger value operations get [`DiffTier::Sample`] and a truncated result.
//!
//! A sample always reads at least `full_threshold_cells` cells (more rows are
//! taken for narrow ranges), so the number of cells a diff examines never
//! drops when the estimate grows. [`DiffPlan::cost`] exposes that number.

use crate::config::DiffConfig;
use crate::intent::{Dimension, IntentOp};
use crate::structure::{LiveStructure, SheetInfo};
use serde::{Deserialize, Serialize};
use sheetgate_common::{CellValue, Grid, GridRange, SheetId};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiffTier {
    Metadata,
    Sample,
    Full,
}

impl fmt::Display for DiffTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiffTier::Metadata => "METADATA",
            DiffTier::Sample => "SAMPLE",
            DiffTier::Full => "FULL",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellChange {
    pub sheet_id: SheetId,
    pub row: u32,
    pub col: u32,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetResize {
    pub title: String,
    pub rows_before: u32,
    pub rows_after: u32,
    pub cols_before: u32,
    pub cols_after: u32,
}

/// Sheet-level change between two structure snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDiff {
    pub sheets_added: Vec<String>,
    pub sheets_removed: Vec<String>,
    /// `(old title, new title)`.
    pub sheets_renamed: Vec<(String, String)>,
    pub sheets_resized: Vec<SheetResize>,
}

impl MetadataDiff {
    pub fn is_empty(&self) -> bool {
        self.sheets_added.is_empty()
            && self.sheets_removed.is_empty()
            && self.sheets_renamed.is_empty()
            && self.sheets_resized.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub tier: DiffTier,
    pub cells_changed: u64,
    pub rows_changed: u64,
    pub cols_changed: u64,
    pub cells_compared: u64,
    /// Set when a SAMPLE diff skipped rows. Not an error.
    pub truncated: bool,
    /// Changed cells, capped at `DiffConfig::max_listed_changes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Vec<CellChange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataDiff>,
}

impl DiffResult {
    pub fn metadata(diff: MetadataDiff) -> Self {
        Self {
            tier: DiffTier::Metadata,
            cells_changed: 0,
            rows_changed: 0,
            cols_changed: 0,
            cells_compared: 0,
            truncated: false,
            sample: None,
            metadata: Some(diff),
        }
    }

    pub fn has_changes(&self) -> bool {
        self.cells_changed > 0 || self.metadata.as_ref().is_some_and(|m| !m.is_empty())
    }
}

/// What a diff will cost and which cells it needs before the mutation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffPlan {
    pub tier: DiffTier,
    pub estimated_cells: u64,
    /// Cells to fetch for the before-state; `None` for METADATA or when the
    /// before-state is known to be empty (appends).
    pub read_range: Option<GridRange>,
    pub truncated: bool,
}

impl DiffPlan {
    /// Cells the diff examines.
    pub fn cost(&self) -> u64 {
        match self.tier {
            DiffTier::Metadata => 0,
            DiffTier::Full => self.estimated_cells,
            DiffTier::Sample => self
                .read_range
                .map_or(self.estimated_cells, |r| r.cell_count()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    config: DiffConfig,
}

impl DiffEngine {
    pub fn new(config: DiffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    pub fn select_tier(&self, op: &IntentOp, estimated_cells: u64) -> DiffTier {
        if op.is_metadata_only() {
            DiffTier::Metadata
        } else if estimated_cells <= self.config.full_threshold_cells {
            DiffTier::Full
        } else {
            DiffTier::Sample
        }
    }

    /// Rows a SAMPLE diff reads for a range `width` columns wide.
    pub fn sample_rows_for(&self, width: u32) -> u32 {
        let width = u64::from(width.max(1));
        let for_threshold = self.config.full_threshold_cells.div_ceil(width);
        let rows = u64::from(self.config.sample_rows).max(for_threshold);
        u32::try_from(rows).unwrap_or(u32::MAX)
    }

    /// Plan the diff for `op` over `affected` (the cells the mutation touches).
    pub fn plan(
        &self,
        op: &IntentOp,
        affected: Option<GridRange>,
        estimated_cells: u64,
        forced: Option<DiffTier>,
    ) -> DiffPlan {
        let tier = forced.unwrap_or_else(|| self.select_tier(op, estimated_cells));
        let before_is_empty = matches!(op, IntentOp::AppendRows { .. });
        let read_range = match (tier, affected) {
            (DiffTier::Metadata, _) | (_, None) => None,
            _ if before_is_empty => None,
            (DiffTier::Full, Some(r)) => Some(r),
            (DiffTier::Sample, Some(r)) => Some(self.sample_window(&r)),
        };
        let truncated = match (tier, affected) {
            (DiffTier::Sample, Some(r)) => r.height() > self.sample_rows_for(r.width()),
            (DiffTier::Sample, None) => true,
            _ => false,
        };
        DiffPlan {
            tier,
            estimated_cells,
            read_range,
            truncated,
        }
    }

    fn sample_window(&self, range: &GridRange) -> GridRange {
        let rows = self.sample_rows_for(range.width()).min(range.height());
        GridRange {
            end_row: range.start_row + rows - 1,
            ..*range
        }
    }

    /// Cells `op` would touch when applied at `target` on `sheet`.
    pub fn estimate_cells(&self, op: &IntentOp, target: Option<&GridRange>, sheet: Option<&SheetInfo>) -> u64 {
        match op {
            IntentOp::ReadValues { .. } | IntentOp::AddSheet { .. } | IntentOp::RenameSheet { .. } => 0,
            IntentOp::WriteValues { values } => values.cell_count() as u64,
            IntentOp::AppendRows { rows } => rows.cell_count() as u64,
            IntentOp::ClearValues | IntentOp::FormatCells { .. } => {
                target.map_or(0, GridRange::cell_count)
            }
            IntentOp::DeleteSheet => sheet.map_or(0, SheetInfo::cell_count),
            IntentOp::InsertDimension {
                dimension, count, ..
            }
            | IntentOp::DeleteDimension {
                dimension, count, ..
            } => {
                let across = sheet.map_or(0, |s| match dimension {
                    Dimension::Rows => s.col_count,
                    Dimension::Columns => s.row_count,
                });
                u64::from(*count) * u64::from(across)
            }
        }
    }

    /// Compare two grids anchored at `anchor`'s top-left corner.
    pub fn diff(&self, anchor: &GridRange, before: &Grid, after: &Grid, tier: DiffTier) -> DiffResult {
        if tier == DiffTier::Metadata {
            return DiffResult::metadata(MetadataDiff::default());
        }
        let height = before.height().max(after.height());
        let width = before.width().max(after.width());
        let compared_rows = match tier {
            DiffTier::Sample => height.min(self.sample_rows_for(width as u32) as usize),
            _ => height,
        };

        let mut rows = BTreeSet::new();
        let mut cols = BTreeSet::new();
        let mut cells_changed = 0u64;
        let mut listed = Vec::new();
        for r in 0..compared_rows {
            for c in 0..width {
                let b = before.get(r, c).rendered();
                let a = after.get(r, c).rendered();
                if b != a {
                    cells_changed += 1;
                    rows.insert(r);
                    cols.insert(c);
                    if listed.len() < self.config.max_listed_changes {
                        listed.push(CellChange {
                            sheet_id: anchor.sheet_id,
                            row: anchor.start_row + r as u32,
                            col: anchor.start_col + c as u32,
                            before: b,
                            after: a,
                        });
                    }
                }
            }
        }

        DiffResult {
            tier,
            cells_changed,
            rows_changed: rows.len() as u64,
            cols_changed: cols.len() as u64,
            cells_compared: (compared_rows * width) as u64,
            truncated: compared_rows < height,
            sample: Some(listed),
            metadata: None,
        }
    }

    /// Sheet-level differences between two structure snapshots.
    pub fn diff_structure(&self, before: &LiveStructure, after: &LiveStructure) -> MetadataDiff {
        let mut out = MetadataDiff::default();
        for old in &before.sheets {
            match after.sheet(old.sheet_id) {
                None => out.sheets_removed.push(old.title.clone()),
                Some(new) => {
                    if new.title != old.title {
                        out.sheets_renamed.push((old.title.clone(), new.title.clone()));
                    }
                    if new.row_count != old.row_count || new.col_count != old.col_count {
                        out.sheets_resized.push(SheetResize {
                            title: new.title.clone(),
                            rows_before: old.row_count,
                            rows_after: new.row_count,
                            cols_before: old.col_count,
                            cols_after: new.col_count,
                        });
                    }
                }
            }
        }
        for new in &after.sheets {
            if before.sheet(new.sheet_id).is_none() {
                out.sheets_added.push(new.title.clone());
            }
        }
        out
    }
}

/// The values `op` leaves behind in a block whose current contents are `before`.
///
/// Only value operations have a projection; structural ones return `None`.
pub fn project(op: &IntentOp, before: &Grid) -> Option<Grid> {
    match op {
        IntentOp::WriteValues { values } => {
            let mut after = before.clone();
            after.overlay(0, 0, values);
            Some(after)
        }
        IntentOp::ClearValues => Some(Grid::filled(
            before.height(),
            before.width(),
            CellValue::Empty,
        )),
        IntentOp::AppendRows { rows } => Some(rows.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetgate_common::RenderMode;

    fn engine() -> DiffEngine {
        DiffEngine::new(DiffConfig {
            sample_rows: 2,
            full_threshold_cells: 4,
            full_ceiling_cells: 100,
            max_listed_changes: 10,
        })
    }

    fn write_op() -> IntentOp {
        IntentOp::WriteValues {
            values: Grid::default(),
        }
    }

    #[test]
    fn tier_selection_by_kind_and_size() {
        let e = engine();
        assert_eq!(e.select_tier(&IntentOp::DeleteSheet, 1_000_000), DiffTier::Metadata);
        assert_eq!(
            e.select_tier(&IntentOp::RenameSheet { title: "x".into() }, 0),
            DiffTier::Metadata
        );
        assert_eq!(e.select_tier(&write_op(), 4), DiffTier::Full);
        assert_eq!(e.select_tier(&write_op(), 5), DiffTier::Sample);
        assert_eq!(
            e.select_tier(&IntentOp::ReadValues { render: RenderMode::Formatted }, 1),
            DiffTier::Full
        );
    }

    #[test]
    fn formulas_with_same_rendering_are_unchanged() {
        let e = engine();
        let anchor = GridRange::cell(0, 0, 0);
        let before = Grid::new(vec![vec![CellValue::formula("=1+1", CellValue::Number(2.0))]]);
        let after = Grid::new(vec![vec![CellValue::formula("=4/2", CellValue::Int(2))]]);
        let d = e.diff(&anchor, &before, &after, DiffTier::Full);
        assert_eq!(d.cells_changed, 0);
        assert!(!d.has_changes());
    }

    #[test]
    fn counts_rows_and_columns() {
        let e = engine();
        let anchor = GridRange::new(3, 10, 2, 11, 3).unwrap();
        let before = Grid::new(vec![
            vec![CellValue::Int(1), CellValue::Int(2)],
            vec![CellValue::Int(3), CellValue::Int(4)],
        ]);
        let mut after = before.clone();
        after.set(0, 1, CellValue::Int(20));
        after.set(1, 1, CellValue::Int(40));
        let d = e.diff(&anchor, &before, &after, DiffTier::Full);
        assert_eq!((d.cells_changed, d.rows_changed, d.cols_changed), (2, 2, 1));
        let first = &d.sample.as_ref().unwrap()[0];
        assert_eq!((first.sheet_id, first.row, first.col), (3, 10, 3));
        assert_eq!(first.before, "2");
        assert_eq!(first.after, "20");
    }

    #[test]
    fn sample_diff_is_flagged_truncated() {
        let e = engine();
        let anchor = GridRange::new(0, 0, 0, 9, 0).unwrap();
        let before = Grid::filled(10, 1, CellValue::Int(0));
        let after = Grid::filled(10, 1, CellValue::Int(1));
        let d = e.diff(&anchor, &before, &after, DiffTier::Sample);
        // Width 1 reads max(2 rows, 4 cells / 1) = 4 rows.
        assert_eq!(d.cells_compared, 4);
        assert_eq!(d.cells_changed, 4);
        assert!(d.truncated);
    }

    #[test]
    fn plan_reads_only_what_the_tier_needs() {
        let e = engine();
        let big = GridRange::new(0, 0, 0, 99, 1).unwrap();
        let plan = e.plan(&IntentOp::ClearValues, Some(big), big.cell_count(), None);
        assert_eq!(plan.tier, DiffTier::Sample);
        assert!(plan.truncated);
        assert_eq!(plan.read_range, Some(GridRange::new(0, 0, 0, 1, 1).unwrap()));
        assert!(plan.cost() >= 4);

        let append = IntentOp::AppendRows { rows: Grid::filled(1, 1, CellValue::Int(1)) };
        let plan = e.plan(&append, Some(GridRange::cell(0, 5, 0)), 1, None);
        assert_eq!(plan.tier, DiffTier::Full);
        assert_eq!(plan.read_range, None);
    }

    #[test]
    fn structure_diff_reports_sheet_changes() {
        let sheet = |id, title: &str, rows| SheetInfo {
            sheet_id: id,
            title: title.into(),
            row_count: rows,
            col_count: 5,
            header_row: vec![],
        };
        let before = LiveStructure {
            object_id: "o".into(),
            title: "t".into(),
            sheets: vec![sheet(1, "A", 10), sheet(2, "B", 10)],
            named_ranges: vec![],
        };
        let after = LiveStructure {
            sheets: vec![sheet(1, "Alpha", 12), sheet(3, "C", 10)],
            ..before.clone()
        };
        let d = engine().diff_structure(&before, &after);
        assert_eq!(d.sheets_added, vec!["C".to_string()]);
        assert_eq!(d.sheets_removed, vec!["B".to_string()]);
        assert_eq!(d.sheets_renamed, vec![("A".to_string(), "Alpha".to_string())]);
        assert_eq!(d.sheets_resized[0].rows_after, 12);
    }

    #[test]
    fn projection_of_writes_and_clears() {
        let before = Grid::filled(2, 2, CellValue::Int(1));
        let after = project(
            &IntentOp::WriteValues {
                values: Grid::new(vec![vec![CellValue::Int(9)]]),
            },
            &before,
        )
        .unwrap();
        assert_eq!(after.get(0, 0), &CellValue::Int(9));
        assert_eq!(after.get(1, 1), &CellValue::Int(1));
        let cleared = project(&IntentOp::ClearValues, &before).unwrap();
        assert!(cleared.get(1, 1).is_empty());
        assert!(project(&IntentOp::DeleteSheet, &before).is_none());
    }
}
