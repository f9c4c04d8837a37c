//! Safety rails evaluated before an intent may reach the network.
//!
//! Checks run in a fixed order: dry-run preview, expected-state precondition,
//! blast radius, explicit-range requirement, then the FULL-diff ceiling. Each
//! check only looks at the intent and the [`PolicyContext`], so any subset can
//! be enabled per intent.

use crate::conflict::checksum_grid;
use crate::diff::{DiffEngine, DiffPlan, DiffResult, DiffTier, MetadataDiff, SheetResize, project};
use crate::error::PolicyViolation;
use crate::intent::{Dimension, Intent, IntentOp};
use crate::structure::{LiveStructure, SheetInfo};
use serde::Serialize;
use sheetgate_common::{Grid, GridRange};

/// Everything the checks may look at. Built by the pipeline after resolution.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub structure: &'a LiveStructure,
    /// Resolved target; `None` only for operations that create a sheet.
    pub target: Option<GridRange>,
    /// Current contents of `target` (or its diff window), when fetched.
    pub current: Option<&'a Grid>,
}

impl PolicyContext<'_> {
    fn sheet(&self) -> Option<&SheetInfo> {
        self.target.and_then(|t| self.structure.sheet(t.sheet_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunPreview {
    pub target: Option<GridRange>,
    pub estimated_cells: u64,
    pub tier: DiffTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffResult>,
    /// Violations that would have blocked a real run.
    pub would_violate: Vec<PolicyViolation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    /// Dry run: allowed, but never executed.
    Preview(DryRunPreview),
}

#[derive(Debug, Clone, Default)]
pub struct PolicyEnforcer {
    diff: DiffEngine,
}

impl PolicyEnforcer {
    pub fn new(diff: DiffEngine) -> Self {
        Self { diff }
    }

    pub fn diff_engine(&self) -> &DiffEngine {
        &self.diff
    }

    pub fn estimate(&self, intent: &Intent, ctx: &PolicyContext<'_>) -> u64 {
        self.diff
            .estimate_cells(&intent.op, ctx.target.as_ref(), ctx.sheet())
    }

    pub fn plan(&self, intent: &Intent, ctx: &PolicyContext<'_>) -> DiffPlan {
        let estimated = self.estimate(intent, ctx);
        self.diff.plan(
            &intent.op,
            affected_range(&intent.op, ctx.target),
            estimated,
            intent.safety.diff_tier,
        )
    }

    pub fn check(
        &self,
        intent: &Intent,
        ctx: &PolicyContext<'_>,
    ) -> Result<PolicyDecision, PolicyViolation> {
        if intent.safety.dry_run {
            return Ok(PolicyDecision::Preview(self.preview(intent, ctx)));
        }
        match self.violations(intent, ctx).into_iter().next() {
            Some(violation) => Err(violation),
            None => Ok(PolicyDecision::Allow),
        }
    }

    /// Every violation, in check order.
    pub fn violations(&self, intent: &Intent, ctx: &PolicyContext<'_>) -> Vec<PolicyViolation> {
        let estimated = self.estimate(intent, ctx);
        [
            self.check_expected_state(intent, ctx),
            self.check_blast_radius(intent, estimated),
            self.check_explicit_range(intent, ctx),
            self.check_full_ceiling(intent, estimated),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn check_expected_state(
        &self,
        intent: &Intent,
        ctx: &PolicyContext<'_>,
    ) -> Option<PolicyViolation> {
        let expected = intent.safety.expected_state.as_ref()?;
        let sheet = ctx.sheet();
        if let Some(rows) = expected.row_count {
            let actual = sheet.map(|s| s.row_count);
            if actual != Some(rows) {
                return Some(mismatch("row_count", rows, actual));
            }
        }
        if let Some(title) = &expected.title {
            let actual = sheet.map(|s| s.title.as_str());
            if actual != Some(title.as_str()) {
                return Some(mismatch("title", title, actual));
            }
        }
        if let Some(checksum) = &expected.checksum {
            // A missing read is a mismatch, never a pass.
            let actual = ctx.current.map(checksum_grid);
            if actual.as_deref() != Some(checksum.as_str()) {
                return Some(mismatch("checksum", checksum, actual));
            }
        }
        None
    }

    fn check_blast_radius(&self, intent: &Intent, estimated: u64) -> Option<PolicyViolation> {
        let limit = intent.safety.effect_scope.as_ref()?.max_cells_affected?;
        (estimated > limit).then_some(PolicyViolation::BlastRadiusExceeded { estimated, limit })
    }

    fn check_explicit_range(
        &self,
        intent: &Intent,
        ctx: &PolicyContext<'_>,
    ) -> Option<PolicyViolation> {
        if !intent.safety.require_explicit_range {
            return None;
        }
        let target = ctx.target?;
        let sheet = ctx.sheet()?;
        target
            .covers_sheet(sheet.row_count, sheet.col_count)
            .then(|| PolicyViolation::ExplicitRangeRequired {
                range: intent.range.to_string(),
            })
    }

    fn check_full_ceiling(&self, intent: &Intent, estimated: u64) -> Option<PolicyViolation> {
        let ceiling = self.diff.config().full_ceiling_cells;
        let forced_full = intent.safety.diff_tier == Some(DiffTier::Full);
        (forced_full && estimated > ceiling && !intent.safety.allow_full_diff_override).then_some(
            PolicyViolation::FullDiffTooLarge {
                cells: estimated,
                ceiling,
            },
        )
    }

    fn preview(&self, intent: &Intent, ctx: &PolicyContext<'_>) -> DryRunPreview {
        let plan = self.plan(intent, ctx);
        let diff = match plan.tier {
            DiffTier::Metadata => {
                Some(DiffResult::metadata(preview_metadata(&intent.op, ctx.sheet())))
            }
            tier => {
                let anchor = affected_range(&intent.op, ctx.target);
                let before = match (&intent.op, ctx.current) {
                    (IntentOp::AppendRows { .. }, _) => Some(Grid::default()),
                    (_, current) => current.cloned(),
                };
                match (anchor, before) {
                    (Some(anchor), Some(before)) => project(&intent.op, &before)
                        .map(|after| self.diff.diff(&anchor, &before, &after, tier)),
                    _ => None,
                }
            }
        };
        DryRunPreview {
            target: ctx.target,
            estimated_cells: plan.estimated_cells,
            tier: plan.tier,
            diff,
            would_violate: self.violations(intent, ctx),
        }
    }
}

/// Cells a value operation actually touches. Writes cover the value block
/// anchored at the target's top-left corner, not the whole target.
pub fn affected_range(op: &IntentOp, target: Option<GridRange>) -> Option<GridRange> {
    let target = target?;
    match op {
        IntentOp::WriteValues { values } => Some(block_at(&target, values)),
        _ => Some(target),
    }
}

/// Rectangle a `grid` occupies when anchored at `anchor`'s top-left corner.
pub fn block_at(anchor: &GridRange, grid: &Grid) -> GridRange {
    let h = (grid.height() as u32).max(1);
    let w = (grid.width() as u32).max(1);
    GridRange {
        sheet_id: anchor.sheet_id,
        start_row: anchor.start_row,
        start_col: anchor.start_col,
        end_row: anchor.start_row.saturating_add(h - 1),
        end_col: anchor.start_col.saturating_add(w - 1),
    }
}

fn mismatch(
    field: &'static str,
    expected: impl ToString,
    actual: Option<impl ToString>,
) -> PolicyViolation {
    PolicyViolation::ExpectedStateMismatch {
        field,
        expected: expected.to_string(),
        actual: actual.map_or_else(|| "<missing>".to_string(), |a| a.to_string()),
    }
}

fn preview_metadata(op: &IntentOp, sheet: Option<&SheetInfo>) -> MetadataDiff {
    let mut out = MetadataDiff::default();
    match (op, sheet) {
        (IntentOp::AddSheet { title, .. }, _) => out.sheets_added.push(title.clone()),
        (IntentOp::DeleteSheet, Some(s)) => out.sheets_removed.push(s.title.clone()),
        (IntentOp::RenameSheet { title }, Some(s)) => {
            out.sheets_renamed.push((s.title.clone(), title.clone()))
        }
        (
            IntentOp::InsertDimension {
                dimension, count, ..
            },
            Some(s),
        ) => out.sheets_resized.push(resized(s, *dimension, i64::from(*count))),
        (
            IntentOp::DeleteDimension {
                dimension, count, ..
            },
            Some(s),
        ) => out
            .sheets_resized
            .push(resized(s, *dimension, -i64::from(*count))),
        _ => {}
    }
    out
}

fn resized(sheet: &SheetInfo, dimension: Dimension, delta: i64) -> SheetResize {
    let apply = |n: u32| (i64::from(n) + delta).clamp(0, i64::from(u32::MAX)) as u32;
    let (rows_after, cols_after) = match dimension {
        Dimension::Rows => (apply(sheet.row_count), sheet.col_count),
        Dimension::Columns => (sheet.row_count, apply(sheet.col_count)),
    };
    SheetResize {
        title: sheet.title.clone(),
        rows_before: sheet.row_count,
        rows_after,
        cols_before: sheet.col_count,
        cols_after,
    }
}
