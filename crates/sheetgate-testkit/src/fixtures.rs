//! Fixture builders.

use crate::backend::{MemoryObject, MemorySheet};
use chrono::{TimeZone, Utc};
use sheetgate::structure::NamedRangeDef;
use sheetgate_common::{CellValue, Grid, GridRange};

/// Builds a [`MemoryObject`]. Sheets get ids 0, 1, 2, ... in insertion order.
#[derive(Debug, Clone)]
pub struct ObjectBuilder {
    object: MemoryObject,
}

impl ObjectBuilder {
    pub fn new(object_id: impl Into<String>) -> Self {
        let object_id = object_id.into();
        Self {
            object: MemoryObject {
                title: object_id.clone(),
                object_id,
                sheets: Vec::new(),
                named_ranges: Vec::new(),
                next_sheet_id: 0,
                modified_at: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default(),
                modifier_id: "fixture".into(),
            },
        }
    }

    pub fn sheet(mut self, title: &str, rows: u32, cols: u32) -> Self {
        let id = self.object.next_sheet_id;
        self.object.next_sheet_id += 1;
        self.object.sheets.push(MemorySheet::new(id, title, rows, cols));
        self
    }

    /// Fill row `row` of `sheet` starting at column 0.
    pub fn row(mut self, sheet: &str, row: u32, values: Vec<CellValue>) -> Self {
        if let Some(s) = self.object.sheets.iter_mut().find(|s| s.title == sheet) {
            for (col, value) in values.into_iter().enumerate() {
                s.set(row, col as u32, value);
            }
        }
        self
    }

    /// Fill a block whose top-left corner is (`row`, `col`).
    pub fn block(mut self, sheet: &str, row: u32, col: u32, values: &Grid) -> Self {
        if let Some(s) = self.object.sheets.iter_mut().find(|s| s.title == sheet) {
            for (dr, r) in values.rows.iter().enumerate() {
                for (dc, v) in r.iter().enumerate() {
                    s.set(row + dr as u32, col + dc as u32, v.clone());
                }
            }
        }
        self
    }

    pub fn named(mut self, name: &str, range: GridRange) -> Self {
        self.object.named_ranges.push(NamedRangeDef {
            name: name.to_string(),
            range,
        });
        self
    }

    pub fn build(self) -> MemoryObject {
        self.object
    }
}

pub fn text(s: &str) -> CellValue {
    CellValue::Text(s.to_string())
}

pub fn ints(values: &[i64]) -> Vec<CellValue> {
    values.iter().map(|v| CellValue::Int(*v)).collect()
}

pub fn row(values: &[&str]) -> Vec<CellValue> {
    values.iter().map(|v| text(v)).collect()
}

pub fn grid(rows: Vec<Vec<CellValue>>) -> Grid {
    Grid::new(rows)
}
