//! Batch compilation: queued intents in, the fewest backend calls out.
//!
//! Intents are grouped per object. Each intent is placed into the earliest
//! call of its family that comes no earlier than the last call holding an
//! intent it conflicts with, so overlapping operations keep submission order
//! while disjoint ones merge freely. Inside a values call, writes that tile a
//! rectangle with no overlapping item between them are coalesced into one
//! item; appends to one sheet are stacked below each other.

use crate::backend::{BackendCall, ReadRequest, StructuralRequest, ValueMutation};
use crate::diff::{DiffEngine, DiffPlan};
use crate::error::{GateError, ResolutionError};
use crate::intent::{Intent, IntentOp, OperationFamily};
use crate::policy::affected_range;
use crate::resolver::RangeResolver;
use crate::structure::LiveStructure;
use rustc_hash::FxHashMap;
use sheetgate_common::{CellValue, Grid, GridRange, RenderMode, SheetId};
use std::sync::Arc;

/// Live structure per object id, fetched once per batch window.
pub type StructureSet = FxHashMap<String, Arc<LiveStructure>>;

/// An intent waiting in a batch window or transaction.
#[derive(Debug, Clone)]
pub struct QueuedIntent {
    /// Submission order; lower is earlier.
    pub seq: u64,
    pub intent: Intent,
    /// Target already resolved against the same structure snapshot, if any.
    pub resolved: Option<GridRange>,
}

impl QueuedIntent {
    pub fn new(seq: u64, intent: Intent) -> Self {
        Self {
            seq,
            intent,
            resolved: None,
        }
    }
}

/// Resolution outcome for one compiled intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIntent {
    pub seq: u64,
    pub object_id: String,
    pub target: Option<GridRange>,
    /// Cells the operation touches (`None` for sheet creation).
    pub affected: Option<GridRange>,
    pub sheet_id: Option<SheetId>,
    pub plan: DiffPlan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPurpose {
    Read,
    /// Before-state read for intents that asked for a diff.
    BeforeState,
    Values,
    Structure,
}

/// Links one intent to the item of a call that carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallMember {
    pub seq: u64,
    /// Index into the call's ranges/data/requests.
    pub item: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCall {
    pub purpose: CallPurpose,
    pub call: BackendCall,
    pub members: Vec<CallMember>,
}

impl CompiledCall {
    pub fn seqs(&self) -> impl Iterator<Item = u64> + '_ {
        self.members.iter().map(|m| m.seq)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackendBatchRequest {
    /// In dispatch order.
    pub calls: Vec<CompiledCall>,
    pub resolved: FxHashMap<u64, ResolvedIntent>,
    /// Intents that could not be compiled; they fail on their own.
    pub rejected: Vec<(u64, GateError)>,
}

impl BackendBatchRequest {
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn object_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for c in &self.calls {
            let id = c.call.object_id();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

/// One intent as the placement pass sees it.
#[derive(Debug, Clone, Copy)]
struct Placed {
    family: OperationFamily,
    affected: Option<GridRange>,
    sheet_id: Option<SheetId>,
}

impl Placed {
    fn conflicts_with(&self, other: &Placed) -> bool {
        use OperationFamily::*;
        match (self.family, other.family) {
            (Read, Read) => false,
            (Structure, _) | (_, Structure) => match (self.sheet_id, other.sheet_id) {
                (Some(a), Some(b)) => a == b,
                // Sheet creation only orders against other structural changes.
                _ => self.family == other.family,
            },
            _ => match (self.affected, other.affected) {
                (Some(a), Some(b)) => a.intersects(&b),
                _ => false,
            },
        }
    }
}

#[derive(Debug)]
enum Items {
    Reads(Vec<ReadRequest>),
    Values(Vec<ValueMutation>),
    Structure(Vec<StructuralRequest>),
}

#[derive(Debug)]
struct Group {
    family: OperationFamily,
    placed: Vec<Placed>,
    members: Vec<CallMember>,
    items: Items,
    before: Vec<(u64, GridRange)>,
}

impl Group {
    fn new(family: OperationFamily) -> Self {
        let items = match family {
            OperationFamily::Read => Items::Reads(Vec::new()),
            OperationFamily::Values => Items::Values(Vec::new()),
            OperationFamily::Structure => Items::Structure(Vec::new()),
        };
        Self {
            family,
            placed: Vec::new(),
            members: Vec::new(),
            items,
            before: Vec::new(),
        }
    }

    fn has_conflict(&self, p: &Placed) -> bool {
        self.placed.iter().any(|q| q.conflicts_with(p))
    }

    fn push_read(&mut self, seq: u64, range: GridRange, render: RenderMode) {
        let Items::Reads(reads) = &mut self.items else {
            return;
        };
        let req = ReadRequest { range, render };
        let item = match reads.iter().position(|r| *r == req) {
            Some(i) => i,
            None => {
                reads.push(req);
                reads.len() - 1
            }
        };
        self.members.push(CallMember { seq, item });
    }

    fn push_values(&mut self, seq: u64, mutation: ValueMutation) {
        let Items::Values(data) = &mut self.items else {
            return;
        };
        if let ValueMutation::Write { range, values } = &mutation {
            if let Some(item) = coalesce_write(data, range, values) {
                self.members.push(CallMember { seq, item });
                return;
            }
        }
        data.push(mutation);
        self.members.push(CallMember {
            seq,
            item: data.len() - 1,
        });
    }

    fn push_structure(&mut self, seq: u64, request: StructuralRequest) {
        let Items::Structure(requests) = &mut self.items else {
            return;
        };
        requests.push(request);
        self.members.push(CallMember {
            seq,
            item: requests.len() - 1,
        });
    }

    fn into_calls(self, object_id: &str) -> Vec<CompiledCall> {
        let mut out = Vec::with_capacity(2);
        if !self.before.is_empty() {
            let mut ranges: Vec<ReadRequest> = Vec::new();
            let mut members = Vec::new();
            for (seq, range) in self.before {
                let req = ReadRequest {
                    range,
                    render: RenderMode::Formatted,
                };
                let item = match ranges.iter().position(|r| *r == req) {
                    Some(i) => i,
                    None => {
                        ranges.push(req);
                        ranges.len() - 1
                    }
                };
                members.push(CallMember { seq, item });
            }
            out.push(CompiledCall {
                purpose: CallPurpose::BeforeState,
                call: BackendCall::BatchGet {
                    object_id: object_id.to_string(),
                    ranges,
                },
                members,
            });
        }
        let object_id = object_id.to_string();
        let (purpose, call) = match self.items {
            Items::Reads(ranges) => (CallPurpose::Read, BackendCall::BatchGet { object_id, ranges }),
            Items::Values(data) => (
                CallPurpose::Values,
                BackendCall::ValuesBatchUpdate { object_id, data },
            ),
            Items::Structure(requests) => (
                CallPurpose::Structure,
                BackendCall::BatchUpdate {
                    object_id,
                    requests,
                },
            ),
        };
        out.push(CompiledCall {
            purpose,
            call,
            members: self.members,
        });
        out
    }
}

fn is_rectangular(grid: &Grid) -> bool {
    let width = grid.width();
    grid.height() > 0 && width > 0 && grid.rows.iter().all(|r| r.len() == width)
}

/// Merge a write into an earlier write item it tiles with, provided nothing
/// queued after that item overlaps the new range. Returns the merged item index.
fn coalesce_write(data: &mut [ValueMutation], range: &GridRange, values: &Grid) -> Option<usize> {
    if !is_rectangular(values) {
        return None;
    }
    for idx in (0..data.len()).rev() {
        let merged = match &data[idx] {
            ValueMutation::Write {
                range: prev,
                values: prev_values,
            } if is_rectangular(prev_values) => prev.tile_with(range).map(|union| {
                let mut grid = Grid::filled(
                    union.height() as usize,
                    union.width() as usize,
                    CellValue::Empty,
                );
                grid.overlay(
                    (prev.start_row - union.start_row) as usize,
                    (prev.start_col - union.start_col) as usize,
                    prev_values,
                );
                grid.overlay(
                    (range.start_row - union.start_row) as usize,
                    (range.start_col - union.start_col) as usize,
                    values,
                );
                (union, grid)
            }),
            _ => None,
        };
        if let Some((union, grid)) = merged {
            data[idx] = ValueMutation::Write {
                range: union,
                values: grid,
            };
            return Some(idx);
        }
        if data[idx].range().intersects(range) {
            return None;
        }
    }
    None
}

#[derive(Debug, Clone, Default)]
pub struct BatchCompiler {
    resolver: RangeResolver,
    diff: DiffEngine,
}

impl BatchCompiler {
    pub fn new(resolver: RangeResolver, diff: DiffEngine) -> Self {
        Self { resolver, diff }
    }

    pub fn compile(&self, queued: &[QueuedIntent], structures: &StructureSet) -> BackendBatchRequest {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("compile_batch", intents = queued.len()).entered();

        let mut out = BackendBatchRequest::default();
        let mut objects: Vec<&str> = Vec::new();
        let mut by_object: FxHashMap<&str, Vec<&QueuedIntent>> = FxHashMap::default();
        let mut sorted: Vec<&QueuedIntent> = queued.iter().collect();
        sorted.sort_by_key(|q| q.seq);
        for q in sorted {
            let id = q.intent.object_id.as_str();
            if !by_object.contains_key(id) {
                objects.push(id);
            }
            by_object.entry(id).or_default().push(q);
        }

        for object_id in objects {
            let intents = by_object.remove(object_id).unwrap_or_default();
            let Some(structure) = structures.get(object_id) else {
                for q in intents {
                    out.rejected.push((
                        q.seq,
                        GateError::Backend(format!("no structure loaded for {object_id}")),
                    ));
                }
                continue;
            };
            let mut groups: Vec<Group> = Vec::new();
            let mut append_offsets: FxHashMap<SheetId, u32> = FxHashMap::default();

            for q in intents {
                let resolved = match self.resolve(q, structure, &mut append_offsets) {
                    Ok(r) => r,
                    Err(e) => {
                        out.rejected.push((q.seq, e.into()));
                        continue;
                    }
                };
                let placed = Placed {
                    family: q.intent.op.family(),
                    affected: resolved.affected,
                    sheet_id: resolved.sheet_id,
                };
                let before = resolved
                    .plan
                    .read_range
                    .filter(|_| q.intent.safety.capture_diff);
                let group = place(&mut groups, placed, before);
                if let Some(read) = before {
                    group.before.push((q.seq, read));
                }
                emit(group, q, &resolved);
                group.placed.push(placed);
                out.resolved.insert(q.seq, resolved);
            }

            for group in groups {
                out.calls.extend(group.into_calls(object_id));
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            calls = out.calls.len(),
            rejected = out.rejected.len(),
            "compiled batch"
        );
        out
    }

    fn resolve(
        &self,
        q: &QueuedIntent,
        structure: &LiveStructure,
        append_offsets: &mut FxHashMap<SheetId, u32>,
    ) -> Result<ResolvedIntent, ResolutionError> {
        let intent = &q.intent;
        let object_id = intent.object_id.as_str();
        let target = match &intent.op {
            IntentOp::AddSheet { .. } => None,
            IntentOp::AppendRows { rows } => {
                let sheet = self.resolver.sheet(object_id, &intent.range, structure)?;
                let offset = append_offsets.entry(sheet.sheet_id).or_insert(0);
                let height = (rows.height() as u32).max(1);
                let range = self.resolver.resolve_append(
                    object_id,
                    &intent.range,
                    structure,
                    height,
                    rows.width() as u32,
                    *offset,
                )?;
                *offset += height;
                Some(range)
            }
            _ => match q.resolved {
                Some(r) => Some(r),
                None => Some(self.resolver.resolve(object_id, &intent.range, structure)?),
            },
        };
        let sheet = target.and_then(|t| structure.sheet(t.sheet_id));
        let affected = affected_range(&intent.op, target);
        let estimated = self.diff.estimate_cells(&intent.op, target.as_ref(), sheet);
        let plan = self
            .diff
            .plan(&intent.op, affected, estimated, intent.safety.diff_tier);
        Ok(ResolvedIntent {
            seq: q.seq,
            object_id: object_id.to_string(),
            target,
            affected,
            sheet_id: target.map(|t| t.sheet_id),
            plan,
        })
    }
}

/// Earliest group of `p`'s family at or after the last group it conflicts with.
///
/// A `before` range is read ahead of the whole group, so a group that already
/// writes into it is skipped.
fn place(groups: &mut Vec<Group>, p: Placed, before: Option<GridRange>) -> &mut Group {
    let pending = before.map(|range| Placed {
        family: OperationFamily::Read,
        affected: Some(range),
        sheet_id: Some(range.sheet_id),
    });
    let usable = |g: &Group| {
        g.family == p.family && pending.as_ref().is_none_or(|b| !g.has_conflict(b))
    };
    let floor = groups.iter().rposition(|g| g.has_conflict(&p));
    let start = match floor {
        Some(idx) if groups[idx].family == p.family => idx,
        Some(idx) => idx + 1,
        None => 0,
    };
    let idx = match (start..groups.len()).find(|&i| usable(&groups[i])) {
        Some(i) => i,
        None => {
            groups.push(Group::new(p.family));
            groups.len() - 1
        }
    };
    &mut groups[idx]
}

fn emit(group: &mut Group, q: &QueuedIntent, resolved: &ResolvedIntent) {
    let seq = q.seq;
    let target = resolved.target;
    match (&q.intent.op, target) {
        (IntentOp::ReadValues { render }, Some(range)) => group.push_read(seq, range, *render),
        (IntentOp::WriteValues { values }, Some(_)) => {
            if let Some(range) = resolved.affected {
                group.push_values(
                    seq,
                    ValueMutation::Write {
                        range,
                        values: values.clone(),
                    },
                );
            }
        }
        (IntentOp::ClearValues, Some(range)) => {
            group.push_values(seq, ValueMutation::Clear { range })
        }
        (IntentOp::AppendRows { rows }, Some(range)) => group.push_values(
            seq,
            ValueMutation::Append {
                range,
                rows: rows.clone(),
            },
        ),
        (IntentOp::FormatCells { format }, Some(range)) => group.push_structure(
            seq,
            StructuralRequest::FormatCells {
                range,
                format: format.clone(),
            },
        ),
        (IntentOp::AddSheet { title, rows, cols }, _) => group.push_structure(
            seq,
            StructuralRequest::AddSheet {
                title: title.clone(),
                rows: *rows,
                cols: *cols,
            },
        ),
        (IntentOp::DeleteSheet, Some(range)) => group.push_structure(
            seq,
            StructuralRequest::DeleteSheet {
                sheet_id: range.sheet_id,
            },
        ),
        (IntentOp::RenameSheet { title }, Some(range)) => group.push_structure(
            seq,
            StructuralRequest::RenameSheet {
                sheet_id: range.sheet_id,
                title: title.clone(),
            },
        ),
        (
            IntentOp::InsertDimension {
                dimension,
                start,
                count,
            },
            Some(range),
        ) => group.push_structure(
            seq,
            StructuralRequest::InsertDimension {
                sheet_id: range.sheet_id,
                dimension: *dimension,
                start: *start,
                count: *count,
            },
        ),
        (
            IntentOp::DeleteDimension {
                dimension,
                start,
                count,
            },
            Some(range),
        ) => group.push_structure(
            seq,
            StructuralRequest::DeleteDimension {
                sheet_id: range.sheet_id,
                dimension: *dimension,
                start: *start,
                count: *count,
            },
        ),
        // Every other operation resolves to a target.
        (_, None) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::RangeSpec;
    use crate::structure::SheetInfo;

    fn structures() -> StructureSet {
        let mut set = StructureSet::default();
        set.insert(
            "obj".into(),
            Arc::new(LiveStructure {
                object_id: "obj".into(),
                title: "Book".into(),
                sheets: vec![
                    SheetInfo {
                        sheet_id: 1,
                        title: "S".into(),
                        row_count: 100,
                        col_count: 26,
                        header_row: vec!["Name".into(), "Revenue".into()],
                    },
                    SheetInfo {
                        sheet_id: 2,
                        title: "T".into(),
                        row_count: 10,
                        col_count: 5,
                        header_row: vec![],
                    },
                ],
                named_ranges: vec![],
            }),
        );
        set
    }

    fn write(seq: u64, a1: &str, v: i64) -> QueuedIntent {
        QueuedIntent::new(
            seq,
            Intent::write(
                "obj",
                RangeSpec::a1(a1),
                Grid::new(vec![vec![CellValue::Int(v)]]),
            ),
        )
    }

    fn read(seq: u64, a1: &str) -> QueuedIntent {
        QueuedIntent::new(seq, Intent::read("obj", RangeSpec::a1(a1)))
    }

    fn compile(q: &[QueuedIntent]) -> BackendBatchRequest {
        BatchCompiler::default().compile(q, &structures())
    }

    fn values_data(call: &CompiledCall) -> &[ValueMutation] {
        match &call.call {
            BackendCall::ValuesBatchUpdate { data, .. } => data,
            other => panic!("not a values call: {other:?}"),
        }
    }

    #[test]
    fn ten_single_cell_writes_make_one_call() {
        let q: Vec<_> = (0..10)
            .map(|i| write(i, &format!("S!{}{}", ["B", "D", "F"][i as usize % 3], i * 3 + 1), i as i64))
            .collect();
        let batch = compile(&q);
        assert_eq!(batch.calls.len(), 1);
        assert_eq!(batch.calls[0].purpose, CallPurpose::Values);
        assert_eq!(batch.calls[0].members.len(), 10);
        assert!(batch.rejected.is_empty());
    }

    #[test]
    fn adjacent_writes_coalesce_into_one_item() {
        let q: Vec<_> = (0..5).map(|i| write(i, &format!("S!A{}", i + 1), i as i64)).collect();
        let batch = compile(&q);
        let data = values_data(&batch.calls[0]);
        assert_eq!(data.len(), 1);
        let ValueMutation::Write { range, values } = &data[0] else {
            panic!("expected a write");
        };
        assert_eq!(*range, GridRange::new(1, 0, 0, 4, 0).unwrap());
        assert_eq!(values.get(4, 0), &CellValue::Int(4));
        assert!(batch.calls[0].members.iter().all(|m| m.item == 0));
    }

    #[test]
    fn overlapping_writes_keep_submission_order() {
        let batch = compile(&[write(0, "S!A1", 1), write(1, "S!A1", 2)]);
        let data = values_data(&batch.calls[0]);
        assert_eq!(data.len(), 2);
        let ValueMutation::Write { values, .. } = &data[1] else {
            panic!("expected a write");
        };
        assert_eq!(values.get(0, 0), &CellValue::Int(2));
    }

    #[test]
    fn tiling_across_an_overlapping_write_is_refused() {
        // A1, then A2 overlapped by a later clear of A2, then A2 again.
        let clear = QueuedIntent::new(
            1,
            Intent::new("obj", RangeSpec::a1("S!A2"), IntentOp::ClearValues),
        );
        let batch = compile(&[write(0, "S!A1", 1), clear, write(2, "S!A2", 2)]);
        assert_eq!(values_data(&batch.calls[0]).len(), 3);
    }

    #[test]
    fn read_after_overlapping_write_is_ordered_after_it() {
        let batch = compile(&[read(0, "S!C1"), write(1, "S!A1", 1), read(2, "S!A1:B2")]);
        let purposes: Vec<_> = batch.calls.iter().map(|c| c.purpose).collect();
        assert_eq!(
            purposes,
            vec![CallPurpose::Read, CallPurpose::Values, CallPurpose::Read]
        );
        let disjoint = compile(&[write(0, "S!A1", 1), read(1, "S!Z1")]);
        assert_eq!(disjoint.calls.len(), 2);
        assert_eq!(disjoint.calls[0].purpose, CallPurpose::Values);
        // A disjoint read joins the earliest read call.
        let moved = compile(&[read(0, "S!Z2"), write(1, "S!A1", 1), read(2, "S!Z1")]);
        assert_eq!(moved.calls.len(), 2);
    }

    #[test]
    fn identical_reads_share_a_range() {
        let batch = compile(&[read(0, "S!A1:B2"), read(1, "S!A1:B2"), read(2, "T!A1")]);
        assert_eq!(batch.calls.len(), 1);
        let BackendCall::BatchGet { ranges, .. } = &batch.calls[0].call else {
            panic!("expected a read");
        };
        assert_eq!(ranges.len(), 2);
        assert_eq!(batch.calls[0].members[0].item, batch.calls[0].members[1].item);
    }

    #[test]
    fn appends_stack_below_each_other() {
        let append = |seq, v| {
            QueuedIntent::new(
                seq,
                Intent::new(
                    "obj",
                    RangeSpec::whole_sheet("T"),
                    IntentOp::AppendRows {
                        rows: Grid::filled(2, 3, CellValue::Int(v)),
                    },
                ),
            )
        };
        let batch = compile(&[append(0, 1), append(1, 2)]);
        let data = values_data(&batch.calls[0]);
        assert_eq!(data[0].range(), &GridRange::new(2, 10, 0, 11, 2).unwrap());
        assert_eq!(data[1].range(), &GridRange::new(2, 12, 0, 13, 2).unwrap());
    }

    #[test]
    fn structural_ops_fence_their_sheet() {
        let delete_row = QueuedIntent::new(
            1,
            Intent::new(
                "obj",
                RangeSpec::whole_sheet("T"),
                IntentOp::DeleteDimension {
                    dimension: crate::intent::Dimension::Rows,
                    start: 0,
                    count: 1,
                },
            ),
        );
        let batch = compile(&[write(0, "T!A1", 1), delete_row, write(2, "T!B2", 2), write(3, "S!A1", 3)]);
        let purposes: Vec<_> = batch.calls.iter().map(|c| c.purpose).collect();
        assert_eq!(
            purposes,
            vec![CallPurpose::Values, CallPurpose::Structure, CallPurpose::Values]
        );
        // The write on the other sheet joins the first values call.
        assert_eq!(batch.calls[0].members.len(), 2);
    }

    #[test]
    fn unresolvable_intents_are_rejected_individually() {
        let bad = QueuedIntent::new(1, Intent::read("obj", RangeSpec::named("Missing")));
        let batch = compile(&[write(0, "S!A1", 1), bad]);
        assert_eq!(batch.calls.len(), 1);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].0, 1);
    }

    #[test]
    fn diff_capture_schedules_a_before_read() {
        let mut w = write(0, "S!A1", 1);
        w.intent = w.intent.capture_diff();
        let batch = compile(&[w]);
        assert_eq!(batch.calls[0].purpose, CallPurpose::BeforeState);
        assert_eq!(batch.calls[1].purpose, CallPurpose::Values);
    }

    #[test]
    fn before_read_follows_an_earlier_write_to_the_same_cells() {
        let mut w = write(1, "S!A1", 2);
        w.intent = w.intent.capture_diff();
        let batch = compile(&[write(0, "S!A1", 1), w, write(2, "S!C1", 3)]);
        let purposes: Vec<_> = batch.calls.iter().map(|c| c.purpose).collect();
        assert_eq!(
            purposes,
            vec![CallPurpose::Values, CallPurpose::BeforeState, CallPurpose::Values]
        );
        assert_eq!(batch.calls[0].members[0].seq, 0);
        assert_eq!(batch.calls[2].members[0].seq, 1);
        // The disjoint write still joins the first call.
        assert_eq!(batch.calls[0].members.len(), 2);
    }

    #[test]
    fn objects_without_structure_are_rejected() {
        let q = QueuedIntent::new(0, Intent::read("other", RangeSpec::a1("A1")));
        let batch = compile(&[q]);
        assert!(batch.calls.is_empty());
        assert!(matches!(batch.rejected[0].1, GateError::Backend(_)));
    }
}
