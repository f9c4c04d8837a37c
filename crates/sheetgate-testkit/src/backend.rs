//! In-memory backend with call recording and fault injection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sheetgate::backend::{
    BackendError, ReadRequest, RevisionInfo, SheetsBackend, StructuralReply, StructuralRequest,
    ValueMutation, ValueRange,
};
use sheetgate::intent::Dimension;
use sheetgate::structure::{LiveStructure, NamedRangeDef, SheetInfo};
use sheetgate_common::{CellValue, Grid, GridRange, SheetId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// One sheet's cells, stored sparsely.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySheet {
    pub sheet_id: SheetId,
    pub title: String,
    pub row_count: u32,
    pub col_count: u32,
    pub cells: BTreeMap<(u32, u32), CellValue>,
}

impl MemorySheet {
    pub fn new(sheet_id: SheetId, title: impl Into<String>, row_count: u32, col_count: u32) -> Self {
        Self {
            sheet_id,
            title: title.into(),
            row_count,
            col_count,
            cells: BTreeMap::new(),
        }
    }

    pub fn get(&self, row: u32, col: u32) -> CellValue {
        self.cells.get(&(row, col)).cloned().unwrap_or_default()
    }

    pub fn set(&mut self, row: u32, col: u32, value: CellValue) {
        if value.is_empty() {
            self.cells.remove(&(row, col));
        } else {
            self.cells.insert((row, col), value);
        }
        self.row_count = self.row_count.max(row + 1);
        self.col_count = self.col_count.max(col + 1);
    }

    fn read(&self, range: &GridRange) -> Grid {
        let mut rows = Vec::with_capacity(range.height() as usize);
        for r in range.start_row..=range.end_row {
            rows.push((range.start_col..=range.end_col).map(|c| self.get(r, c)).collect());
        }
        Grid::new(rows)
    }

    fn write(&mut self, range: &GridRange, values: &Grid) -> u64 {
        let mut written = 0;
        for (dr, row) in values.rows.iter().enumerate() {
            for (dc, value) in row.iter().enumerate() {
                self.set(range.start_row + dr as u32, range.start_col + dc as u32, value.clone());
                written += 1;
            }
        }
        written
    }

    fn clear(&mut self, range: &GridRange) -> u64 {
        self.cells.retain(|(r, c), _| !range.contains_cell(*r, *c));
        range.cell_count()
    }

    fn header_row(&self) -> Vec<String> {
        (0..self.col_count).map(|c| self.get(0, c).rendered()).collect()
    }

    fn shift(&mut self, dimension: Dimension, start: u32, count: u32, insert: bool) {
        let moved: BTreeMap<(u32, u32), CellValue> = std::mem::take(&mut self.cells)
            .into_iter()
            .filter_map(|((r, c), v)| {
                let at = match dimension {
                    Dimension::Rows => r,
                    Dimension::Columns => c,
                };
                let new_at = if at < start {
                    at
                } else if insert {
                    at + count
                } else if at < start + count {
                    return None;
                } else {
                    at - count
                };
                Some(match dimension {
                    Dimension::Rows => ((new_at, c), v),
                    Dimension::Columns => ((r, new_at), v),
                })
            })
            .collect();
        self.cells = moved;
        let extent = match dimension {
            Dimension::Rows => &mut self.row_count,
            Dimension::Columns => &mut self.col_count,
        };
        *extent = if insert {
            *extent + count
        } else {
            extent.saturating_sub(count.min(extent.saturating_sub(start)))
        };
    }
}

/// Full contents of one backend object. Compared with `==` to check that a
/// rollback restored an object exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryObject {
    pub object_id: String,
    pub title: String,
    pub sheets: Vec<MemorySheet>,
    pub named_ranges: Vec<NamedRangeDef>,
    pub next_sheet_id: SheetId,
    pub modified_at: DateTime<Utc>,
    pub modifier_id: String,
}

impl MemoryObject {
    pub fn sheet(&self, title: &str) -> Option<&MemorySheet> {
        self.sheets.iter().find(|s| s.title == title)
    }

    fn sheet_mut(&mut self, sheet_id: SheetId) -> Result<&mut MemorySheet, BackendError> {
        self.sheets
            .iter_mut()
            .find(|s| s.sheet_id == sheet_id)
            .ok_or_else(|| BackendError::Invalid(format!("no sheet with id {sheet_id}")))
    }

    fn structure(&self) -> LiveStructure {
        LiveStructure {
            object_id: self.object_id.clone(),
            title: self.title.clone(),
            sheets: self
                .sheets
                .iter()
                .map(|s| SheetInfo {
                    sheet_id: s.sheet_id,
                    title: s.title.clone(),
                    row_count: s.row_count,
                    col_count: s.col_count,
                    header_row: s.header_row(),
                })
                .collect(),
            named_ranges: self.named_ranges.clone(),
        }
    }

    fn touch(&mut self, modifier: &str) {
        self.modified_at = Utc::now();
        self.modifier_id = modifier.to_string();
    }
}

/// What a recorded call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub kind: &'static str,
    pub object_id: String,
    /// Ranges, mutations or requests carried by the call.
    pub items: usize,
    /// Whether the call failed (injected or otherwise).
    pub failed: bool,
}

/// Which calls a [`Fault`] applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultScope {
    Any,
    Reads,
    Mutations,
}

impl FaultScope {
    fn matches(self, kind: &str) -> bool {
        match self {
            FaultScope::Any => true,
            FaultScope::Reads => matches!(kind, "fetch_structure" | "batch_get"),
            FaultScope::Mutations => matches!(kind, "values_batch_update" | "batch_update"),
        }
    }
}

/// A scheduled failure: the first `skip` matching calls go through, the next
/// one fails with `error` without touching state.
#[derive(Debug, Clone)]
pub struct Fault {
    pub scope: FaultScope,
    pub skip: usize,
    pub error: BackendError,
}

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<String, MemoryObject>,
    calls: Vec<RecordedCall>,
    faults: Vec<Fault>,
}

/// Shared-state in-memory backend. Clones see the same objects.
#[derive(Debug, Clone)]
pub struct InMemorySheets {
    inner: Arc<Mutex<Inner>>,
    latency: Option<Duration>,
    read_delay: Option<Duration>,
    modifier_id: Arc<str>,
}

impl Default for InMemorySheets {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySheets {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            latency: None,
            read_delay: None,
            modifier_id: Arc::from("memory"),
        }
    }

    /// Every call sleeps `latency` (on the tokio clock) before answering.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::new()
        }
    }

    /// `batch_get` reads state as soon as it arrives but holds the reply for
    /// `delay`, so writes landing meanwhile are not reflected in it.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    pub fn insert(&self, object: MemoryObject) {
        self.inner.lock().objects.insert(object.object_id.clone(), object);
    }

    pub fn object(&self, object_id: &str) -> Option<MemoryObject> {
        self.inner.lock().objects.get(object_id).cloned()
    }

    /// Value of one cell, looked up by sheet title.
    pub fn cell(&self, object_id: &str, sheet: &str, row: u32, col: u32) -> Option<CellValue> {
        let inner = self.inner.lock();
        let object = inner.objects.get(object_id)?;
        Some(object.sheet(sheet)?.get(row, col))
    }

    /// Change a cell behind the gate's back, as another client would.
    pub fn set_cell(&self, object_id: &str, sheet: &str, row: u32, col: u32, value: CellValue) {
        let mut inner = self.inner.lock();
        if let Some(object) = inner.objects.get_mut(object_id) {
            if let Some(s) = object.sheets.iter_mut().find(|s| s.title == sheet) {
                s.set(row, col, value);
                object.touch("external");
            }
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.inner.lock().calls.clone()
    }

    pub fn calls_of(&self, kind: &str) -> Vec<RecordedCall> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.kind == kind)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    pub fn inject(&self, fault: Fault) {
        self.inner.lock().faults.push(fault);
    }

    /// The next `n` calls of any kind answer with a quota error.
    pub fn throttle_next(&self, n: usize, retry_after: Option<Duration>) {
        for _ in 0..n {
            self.inject(Fault {
                scope: FaultScope::Any,
                skip: 0,
                error: BackendError::Throttled { retry_after },
            });
        }
    }

    /// Let `skip` mutating calls through, then fail the next one.
    pub fn fail_mutation_after(&self, skip: usize, error: BackendError) {
        self.inject(Fault {
            scope: FaultScope::Mutations,
            skip,
            error,
        });
    }

    pub fn clear_faults(&self) {
        self.inner.lock().faults.clear();
    }

    /// Replace an object wholesale (used by snapshot restore).
    pub(crate) fn replace(&self, object: MemoryObject) {
        self.insert(object);
    }

    async fn begin(&self, kind: &'static str, object_id: &str, items: usize) -> Result<(), BackendError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut inner = self.inner.lock();
        let fault = inner
            .faults
            .iter_mut()
            .position(|f| f.scope.matches(kind))
            .and_then(|i| {
                let fault = &mut inner.faults[i];
                if fault.skip > 0 {
                    fault.skip -= 1;
                    None
                } else {
                    Some(i)
                }
            });
        let error = fault.map(|i| inner.faults.remove(i).error);
        let error = match error {
            Some(e) => Some(e),
            None if !inner.objects.contains_key(object_id) => {
                Some(BackendError::NotFound(object_id.to_string()))
            }
            None => None,
        };
        inner.calls.push(RecordedCall {
            kind,
            object_id: object_id.to_string(),
            items,
            failed: error.is_some(),
        });
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn with_object<T>(
        &self,
        object_id: &str,
        f: impl FnOnce(&mut MemoryObject) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut inner = self.inner.lock();
        let object = inner
            .objects
            .get_mut(object_id)
            .ok_or_else(|| BackendError::NotFound(object_id.to_string()))?;
        f(object)
    }
}

#[async_trait]
impl SheetsBackend for InMemorySheets {
    async fn fetch_structure(&self, object_id: &str) -> Result<LiveStructure, BackendError> {
        self.begin("fetch_structure", object_id, 1).await?;
        self.with_object(object_id, |o| Ok(o.structure()))
    }

    async fn batch_get(
        &self,
        object_id: &str,
        ranges: &[ReadRequest],
    ) -> Result<Vec<ValueRange>, BackendError> {
        self.begin("batch_get", object_id, ranges.len()).await?;
        let read = self.with_object(object_id, |o| {
            let revision = RevisionInfo {
                modified_at: o.modified_at,
                modifier_id: o.modifier_id.clone(),
            };
            ranges
                .iter()
                .map(|req| {
                    let sheet = o
                        .sheets
                        .iter()
                        .find(|s| s.sheet_id == req.range.sheet_id)
                        .ok_or_else(|| {
                            BackendError::Invalid(format!("no sheet with id {}", req.range.sheet_id))
                        })?;
                    let raw = sheet.read(&req.range);
                    let values = Grid::new(
                        raw.rows
                            .iter()
                            .map(|r| r.iter().map(|v| v.render_as(req.render)).collect())
                            .collect(),
                    );
                    Ok(ValueRange {
                        range: req.range,
                        values,
                        revision: Some(revision.clone()),
                    })
                })
                .collect()
        });
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        read
    }

    async fn values_batch_update(
        &self,
        object_id: &str,
        data: &[ValueMutation],
    ) -> Result<Vec<u64>, BackendError> {
        self.begin("values_batch_update", object_id, data.len()).await?;
        let modifier = self.modifier_id.clone();
        self.with_object(object_id, |o| {
            // Validate everything first so a bad item leaves no partial write.
            for m in data {
                if !o.sheets.iter().any(|s| s.sheet_id == m.range().sheet_id) {
                    return Err(BackendError::Invalid(format!(
                        "no sheet with id {}",
                        m.range().sheet_id
                    )));
                }
            }
            let mut counts = Vec::with_capacity(data.len());
            for m in data {
                let sheet = o.sheet_mut(m.range().sheet_id)?;
                counts.push(match m {
                    ValueMutation::Write { range, values } => sheet.write(range, values),
                    ValueMutation::Clear { range } => sheet.clear(range),
                    ValueMutation::Append { range, rows } => {
                        // Appends land below whatever is there now.
                        let at = GridRange {
                            start_row: sheet.row_count,
                            end_row: sheet.row_count + range.height() - 1,
                            ..*range
                        };
                        let n = sheet.write(&at, rows);
                        sheet.row_count = sheet.row_count.max(at.start_row + rows.height() as u32);
                        n
                    }
                });
            }
            o.touch(&modifier);
            Ok(counts)
        })
    }

    async fn batch_update(
        &self,
        object_id: &str,
        requests: &[StructuralRequest],
    ) -> Result<Vec<StructuralReply>, BackendError> {
        self.begin("batch_update", object_id, requests.len()).await?;
        let modifier = self.modifier_id.clone();
        self.with_object(object_id, |o| {
            let mut staged = o.clone();
            let mut replies = Vec::with_capacity(requests.len());
            for request in requests {
                replies.push(apply_structural(&mut staged, request)?);
            }
            staged.touch(&modifier);
            *o = staged;
            Ok(replies)
        })
    }
}

fn apply_structural(
    o: &mut MemoryObject,
    request: &StructuralRequest,
) -> Result<StructuralReply, BackendError> {
    match request {
        StructuralRequest::AddSheet { title, rows, cols } => {
            if o.sheets.iter().any(|s| s.title == *title) {
                return Err(BackendError::Invalid(format!("sheet `{title}` already exists")));
            }
            let sheet_id = o.next_sheet_id;
            o.next_sheet_id += 1;
            o.sheets.push(MemorySheet::new(sheet_id, title.clone(), *rows, *cols));
            Ok(StructuralReply::AddSheet { sheet_id })
        }
        StructuralRequest::DeleteSheet { sheet_id } => {
            let before = o.sheets.len();
            o.sheets.retain(|s| s.sheet_id != *sheet_id);
            if o.sheets.len() == before {
                return Err(BackendError::Invalid(format!("no sheet with id {sheet_id}")));
            }
            o.named_ranges.retain(|n| n.range.sheet_id != *sheet_id);
            Ok(StructuralReply::Done)
        }
        StructuralRequest::RenameSheet { sheet_id, title } => {
            o.sheet_mut(*sheet_id)?.title = title.clone();
            Ok(StructuralReply::Done)
        }
        StructuralRequest::InsertDimension {
            sheet_id,
            dimension,
            start,
            count,
        } => {
            o.sheet_mut(*sheet_id)?.shift(*dimension, *start, *count, true);
            Ok(StructuralReply::Done)
        }
        StructuralRequest::DeleteDimension {
            sheet_id,
            dimension,
            start,
            count,
        } => {
            o.sheet_mut(*sheet_id)?.shift(*dimension, *start, *count, false);
            Ok(StructuralReply::Done)
        }
        StructuralRequest::FormatCells { range, .. } => {
            o.sheet_mut(range.sheet_id)?;
            Ok(StructuralReply::Done)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ObjectBuilder, ints};
    use sheetgate_common::RenderMode;

    fn backend() -> InMemorySheets {
        let b = InMemorySheets::new();
        b.insert(
            ObjectBuilder::new("obj")
                .sheet("Data", 10, 3)
                .row("Data", 0, ints(&[1, 2, 3]))
                .build(),
        );
        b
    }

    #[tokio::test]
    async fn reads_render_and_record() {
        let b = backend();
        let got = b
            .batch_get(
                "obj",
                &[ReadRequest {
                    range: GridRange::new(0, 0, 0, 0, 2).unwrap(),
                    render: RenderMode::Unformatted,
                }],
            )
            .await
            .unwrap();
        assert_eq!(got[0].values, Grid::new(vec![ints(&[1, 2, 3])]));
        assert_eq!(b.calls_of("batch_get").len(), 1);
    }

    #[tokio::test]
    async fn faults_skip_then_fire_once() {
        let b = backend();
        b.fail_mutation_after(1, BackendError::Unavailable("down".into()));
        let write = [ValueMutation::Clear {
            range: GridRange::cell(0, 0, 0),
        }];
        assert!(b.values_batch_update("obj", &write).await.is_ok());
        assert!(b.values_batch_update("obj", &write).await.is_err());
        assert!(b.values_batch_update("obj", &write).await.is_ok());
        assert_eq!(b.calls().iter().filter(|c| c.failed).count(), 1);
    }

    #[tokio::test]
    async fn delete_rows_shifts_cells_up() {
        let b = backend();
        b.set_cell("obj", "Data", 3, 0, CellValue::Int(9));
        b.batch_update(
            "obj",
            &[StructuralRequest::DeleteDimension {
                sheet_id: 0,
                dimension: Dimension::Rows,
                start: 1,
                count: 2,
            }],
        )
        .await
        .unwrap();
        assert_eq!(b.cell("obj", "Data", 1, 0), Some(CellValue::Int(9)));
        assert_eq!(b.object("obj").unwrap().sheets[0].row_count, 8);
    }
}
