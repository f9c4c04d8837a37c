use crate::coord::format_a1;
use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Backend-assigned sheet identifier (stable across renames).
pub type SheetId = u32;

/// Concrete rectangular grid address on one sheet.
///
/// Bounds are zero-based and inclusive on both axes, and construction
/// guarantees `start <= end`. Deserialization goes through the same check.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(try_from = "RawGridRange")
)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridRange {
    pub sheet_id: SheetId,
    pub start_row: u32,
    pub start_col: u32,
    pub end_row: u32,
    pub end_col: u32,
}

/// Wire shape of [`GridRange`] before its bounds are checked.
#[cfg(feature = "serde")]
#[derive(Deserialize)]
struct RawGridRange {
    sheet_id: SheetId,
    start_row: u32,
    start_col: u32,
    end_row: u32,
    end_col: u32,
}

#[cfg(feature = "serde")]
impl TryFrom<RawGridRange> for GridRange {
    type Error = RangeOrderError;

    fn try_from(raw: RawGridRange) -> Result<Self, Self::Error> {
        GridRange::new(raw.sheet_id, raw.start_row, raw.start_col, raw.end_row, raw.end_col)
    }
}

/// Returned when a range would violate `start <= end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeOrderError {
    pub start_row: u32,
    pub start_col: u32,
    pub end_row: u32,
    pub end_col: u32,
}

impl fmt::Display for RangeOrderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "range must be ordered so the start is above/left of the end (rows {}..={}, cols {}..={})",
            self.start_row, self.end_row, self.start_col, self.end_col
        )
    }
}

impl std::error::Error for RangeOrderError {}

impl GridRange {
    pub fn new(
        sheet_id: SheetId,
        start_row: u32,
        start_col: u32,
        end_row: u32,
        end_col: u32,
    ) -> Result<Self, RangeOrderError> {
        if start_row > end_row || start_col > end_col {
            return Err(RangeOrderError {
                start_row,
                start_col,
                end_row,
                end_col,
            });
        }
        Ok(Self {
            sheet_id,
            start_row,
            start_col,
            end_row,
            end_col,
        })
    }

    pub fn cell(sheet_id: SheetId, row: u32, col: u32) -> Self {
        Self {
            sheet_id,
            start_row: row,
            start_col: col,
            end_row: row,
            end_col: col,
        }
    }

    /// The full extent of a sheet with `rows` x `cols` cells (at least one cell).
    pub fn whole_sheet(sheet_id: SheetId, rows: u32, cols: u32) -> Self {
        Self {
            sheet_id,
            start_row: 0,
            start_col: 0,
            end_row: rows.max(1) - 1,
            end_col: cols.max(1) - 1,
        }
    }

    pub fn height(&self) -> u32 {
        self.end_row - self.start_row + 1
    }

    pub fn width(&self) -> u32 {
        self.end_col - self.start_col + 1
    }

    pub fn cell_count(&self) -> u64 {
        u64::from(self.height()) * u64::from(self.width())
    }

    pub fn is_single_cell(&self) -> bool {
        self.start_row == self.end_row && self.start_col == self.end_col
    }

    pub fn rows_overlap(&self, other: &GridRange) -> bool {
        self.start_row <= other.end_row && self.end_row >= other.start_row
    }

    pub fn cols_overlap(&self, other: &GridRange) -> bool {
        self.start_col <= other.end_col && self.end_col >= other.start_col
    }

    /// Axis-aligned rectangle intersection on the same sheet.
    pub fn intersects(&self, other: &GridRange) -> bool {
        self.sheet_id == other.sheet_id && self.rows_overlap(other) && self.cols_overlap(other)
    }

    pub fn intersection(&self, other: &GridRange) -> Option<GridRange> {
        if !self.intersects(other) {
            return None;
        }
        Some(GridRange {
            sheet_id: self.sheet_id,
            start_row: self.start_row.max(other.start_row),
            start_col: self.start_col.max(other.start_col),
            end_row: self.end_row.min(other.end_row),
            end_col: self.end_col.min(other.end_col),
        })
    }

    pub fn contains(&self, other: &GridRange) -> bool {
        self.sheet_id == other.sheet_id
            && self.start_row <= other.start_row
            && self.end_row >= other.end_row
            && self.start_col <= other.start_col
            && self.end_col >= other.end_col
    }

    pub fn contains_cell(&self, row: u32, col: u32) -> bool {
        (self.start_row..=self.end_row).contains(&row)
            && (self.start_col..=self.end_col).contains(&col)
    }

    /// True if `self` covers every cell of a `rows` x `cols` sheet.
    pub fn covers_sheet(&self, rows: u32, cols: u32) -> bool {
        self.start_row == 0
            && self.start_col == 0
            && self.end_row + 1 >= rows
            && self.end_col + 1 >= cols
    }

    /// Union of two ranges when together they tile a rectangle exactly.
    ///
    /// Two ranges tile when they share both column bounds and are vertically
    /// adjacent, or share both row bounds and are horizontally adjacent.
    pub fn tile_with(&self, other: &GridRange) -> Option<GridRange> {
        if self.sheet_id != other.sheet_id {
            return None;
        }
        let same_cols = self.start_col == other.start_col && self.end_col == other.end_col;
        let same_rows = self.start_row == other.start_row && self.end_row == other.end_row;
        if same_cols && self.end_row.checked_add(1) == Some(other.start_row) {
            return Some(GridRange {
                end_row: other.end_row,
                ..*self
            });
        }
        if same_cols && other.end_row.checked_add(1) == Some(self.start_row) {
            return Some(GridRange {
                start_row: other.start_row,
                ..*self
            });
        }
        if same_rows && self.end_col.checked_add(1) == Some(other.start_col) {
            return Some(GridRange {
                end_col: other.end_col,
                ..*self
            });
        }
        if same_rows && other.end_col.checked_add(1) == Some(self.start_col) {
            return Some(GridRange {
                start_col: other.start_col,
                ..*self
            });
        }
        None
    }

    /// A1 text for the rectangle, without the sheet prefix.
    pub fn to_a1(&self) -> String {
        format_a1(self.start_row, self.start_col, self.end_row, self.end_col)
    }
}

impl fmt::Display for GridRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}!{}", self.sheet_id, self.to_a1())
    }
}
