//! Intents: immutable, semantically-addressed requests to read or mutate one
//! backend object.
//!
//! Each [`IntentOp`] variant carries only the payload its operation needs.
//! Addresses stay symbolic ([`RangeSpec`]) until the resolver pins them to a
//! [`GridRange`](sheetgate_common::GridRange) against live structure.

use crate::diff::DiffTier;
use serde::{Deserialize, Serialize};
use sheetgate_common::{Grid, RenderMode};
use std::fmt;

/// Symbolic address of the cells an intent targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RangeSpec {
    /// Explicit zero-based coordinates. Open axes (`None`) span the sheet.
    Grid {
        sheet: String,
        #[serde(default)]
        rows: Option<(u32, u32)>,
        #[serde(default)]
        cols: Option<(u32, u32)>,
    },
    /// A1 text such as `Sheet1!A1:B10`, `Data!A:C`, or a bare sheet title.
    A1 { a1: String },
    /// A named range defined on the object.
    Named { name: String },
    /// The column under a header in the first row of `sheet`.
    Semantic {
        sheet: String,
        header: String,
        #[serde(default)]
        include_header: bool,
    },
}

impl RangeSpec {
    pub fn a1(a1: impl Into<String>) -> Self {
        RangeSpec::A1 { a1: a1.into() }
    }

    pub fn named(name: impl Into<String>) -> Self {
        RangeSpec::Named { name: name.into() }
    }

    pub fn column(sheet: impl Into<String>, header: impl Into<String>) -> Self {
        RangeSpec::Semantic {
            sheet: sheet.into(),
            header: header.into(),
            include_header: false,
        }
    }

    pub fn whole_sheet(sheet: impl Into<String>) -> Self {
        RangeSpec::Grid {
            sheet: sheet.into(),
            rows: None,
            cols: None,
        }
    }
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeSpec::Grid { sheet, rows, cols } => {
                write!(f, "{sheet}[rows {rows:?}, cols {cols:?}]")
            }
            RangeSpec::A1 { a1 } => f.write_str(a1),
            RangeSpec::Named { name } => write!(f, "name:{name}"),
            RangeSpec::Semantic { sheet, header, .. } => write!(f, "{sheet}[header={header}]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Rows,
    Columns,
}

/// Cell formatting applied by [`IntentOp::FormatCells`]. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellFormat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bold: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
}

/// Operation payloads, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IntentOp {
    ReadValues {
        #[serde(default)]
        render: RenderMode,
    },
    WriteValues { values: Grid },
    ClearValues,
    AppendRows { rows: Grid },
    FormatCells { format: CellFormat },
    AddSheet {
        title: String,
        #[serde(default = "default_sheet_rows")]
        rows: u32,
        #[serde(default = "default_sheet_cols")]
        cols: u32,
    },
    DeleteSheet,
    RenameSheet { title: String },
    InsertDimension {
        dimension: Dimension,
        start: u32,
        count: u32,
    },
    DeleteDimension {
        dimension: Dimension,
        start: u32,
        count: u32,
    },
}

fn default_sheet_rows() -> u32 {
    1000
}

fn default_sheet_cols() -> u32 {
    26
}

/// Quota bucket an operation draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Read,
    Write,
}

impl OperationClass {
    pub const ALL: [OperationClass; 2] = [OperationClass::Read, OperationClass::Write];

    pub fn index(self) -> usize {
        match self {
            OperationClass::Read => 0,
            OperationClass::Write => 1,
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationClass::Read => "read",
            OperationClass::Write => "write",
        })
    }
}

/// Intents in the same family compile into the same kind of backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationFamily {
    /// `values:batchGet`.
    Read,
    /// `values:batchUpdate` (writes, clears, appends).
    Values,
    /// `batchUpdate` (sheets, dimensions, formatting).
    Structure,
}

impl IntentOp {
    pub fn kind(&self) -> &'static str {
        match self {
            IntentOp::ReadValues { .. } => "read_values",
            IntentOp::WriteValues { .. } => "write_values",
            IntentOp::ClearValues => "clear_values",
            IntentOp::AppendRows { .. } => "append_rows",
            IntentOp::FormatCells { .. } => "format_cells",
            IntentOp::AddSheet { .. } => "add_sheet",
            IntentOp::DeleteSheet => "delete_sheet",
            IntentOp::RenameSheet { .. } => "rename_sheet",
            IntentOp::InsertDimension { .. } => "insert_dimension",
            IntentOp::DeleteDimension { .. } => "delete_dimension",
        }
    }

    pub fn family(&self) -> OperationFamily {
        match self {
            IntentOp::ReadValues { .. } => OperationFamily::Read,
            IntentOp::WriteValues { .. } | IntentOp::ClearValues | IntentOp::AppendRows { .. } => {
                OperationFamily::Values
            }
            IntentOp::FormatCells { .. }
            | IntentOp::AddSheet { .. }
            | IntentOp::DeleteSheet
            | IntentOp::RenameSheet { .. }
            | IntentOp::InsertDimension { .. }
            | IntentOp::DeleteDimension { .. } => OperationFamily::Structure,
        }
    }

    pub fn class(&self) -> OperationClass {
        match self {
            IntentOp::ReadValues { .. } => OperationClass::Read,
            _ => OperationClass::Write,
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, IntentOp::ReadValues { .. })
    }

    /// Changes structure or formatting, never cell values.
    pub fn is_metadata_only(&self) -> bool {
        self.family() == OperationFamily::Structure
    }

    /// Shifts or removes coordinates, so cached ranges on the sheet go stale.
    pub fn reshapes_sheet(&self) -> bool {
        matches!(
            self,
            IntentOp::AddSheet { .. }
                | IntentOp::DeleteSheet
                | IntentOp::RenameSheet { .. }
                | IntentOp::InsertDimension { .. }
                | IntentOp::DeleteDimension { .. }
        )
    }

    /// Replaying the operation yields the same backend state.
    pub fn is_idempotent(&self) -> bool {
        !matches!(
            self,
            IntentOp::AppendRows { .. }
                | IntentOp::AddSheet { .. }
                | IntentOp::InsertDimension { .. }
                | IntentOp::DeleteDimension { .. }
        )
    }
}

/// `expectedState` precondition; every populated field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedState {
    /// Row count of the target sheet.
    #[serde(default)]
    pub row_count: Option<u32>,
    /// Title of the target sheet.
    #[serde(default)]
    pub title: Option<String>,
    /// Content checksum of the resolved range (see [`crate::conflict::checksum_grid`]).
    #[serde(default)]
    pub checksum: Option<String>,
}

impl ExpectedState {
    pub fn is_empty(&self) -> bool {
        self.row_count.is_none() && self.title.is_none() && self.checksum.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectScope {
    #[serde(default)]
    pub max_cells_affected: Option<u64>,
}

/// Per-intent safety rails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub expected_state: Option<ExpectedState>,
    #[serde(default)]
    pub effect_scope: Option<EffectScope>,
    #[serde(default)]
    pub require_explicit_range: bool,
    /// Capture a before/after diff and return it with the outcome.
    #[serde(default)]
    pub capture_diff: bool,
    /// Force a tier instead of the automatic selection.
    #[serde(default)]
    pub diff_tier: Option<DiffTier>,
    /// Allow a forced FULL tier above the hard cell ceiling.
    #[serde(default)]
    pub allow_full_diff_override: bool,
}

/// A request against one backend object. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub object_id: String,
    pub range: RangeSpec,
    #[serde(flatten)]
    pub op: IntentOp,
    #[serde(default)]
    pub safety: SafetyConfig,
}

impl Intent {
    pub fn new(object_id: impl Into<String>, range: RangeSpec, op: IntentOp) -> Self {
        Self {
            object_id: object_id.into(),
            range,
            op,
            safety: SafetyConfig::default(),
        }
    }

    pub fn read(object_id: impl Into<String>, range: RangeSpec) -> Self {
        Self::new(
            object_id,
            range,
            IntentOp::ReadValues {
                render: RenderMode::Formatted,
            },
        )
    }

    pub fn write(object_id: impl Into<String>, range: RangeSpec, values: Grid) -> Self {
        Self::new(object_id, range, IntentOp::WriteValues { values })
    }

    pub fn with_safety(mut self, safety: SafetyConfig) -> Self {
        self.safety = safety;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.safety.dry_run = true;
        self
    }

    pub fn expecting(mut self, expected: ExpectedState) -> Self {
        self.safety.expected_state = Some(expected);
        self
    }

    pub fn max_cells(mut self, limit: u64) -> Self {
        self.safety.effect_scope = Some(EffectScope {
            max_cells_affected: Some(limit),
        });
        self
    }

    pub fn require_explicit_range(mut self) -> Self {
        self.safety.require_explicit_range = true;
        self
    }

    pub fn capture_diff(mut self) -> Self {
        self.safety.capture_diff = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetgate_common::CellValue;

    #[test]
    fn families_and_classes() {
        let write = IntentOp::WriteValues {
            values: Grid::new(vec![vec![CellValue::Int(1)]]),
        };
        assert_eq!(write.family(), OperationFamily::Values);
        assert_eq!(write.class(), OperationClass::Write);
        assert!(write.is_idempotent());
        let append = IntentOp::AppendRows { rows: Grid::default() };
        assert!(!append.is_idempotent());
        assert_eq!(IntentOp::DeleteSheet.family(), OperationFamily::Structure);
        assert_eq!(
            IntentOp::ReadValues {
                render: RenderMode::Formatted
            }
            .class(),
            OperationClass::Read
        );
    }

    #[test]
    fn intent_deserializes_from_flat_json() {
        let json = r#"{
            "object_id": "sheet-1",
            "range": {"kind": "semantic", "sheet": "Data", "header": "Revenue"},
            "op": "write_values",
            "values": {"rows": [[{"type": "Number", "value": 5.0}]]},
            "safety": {"dry_run": true}
        }"#;
        let intent: Intent = serde_json::from_str(json).unwrap();
        assert_eq!(intent.object_id, "sheet-1");
        assert!(intent.safety.dry_run);
        assert!(matches!(intent.op, IntentOp::WriteValues { .. }));
        assert_eq!(
            intent.range,
            RangeSpec::Semantic {
                sheet: "Data".into(),
                header: "Revenue".into(),
                include_header: false
            }
        );
    }
}
