//! Symbolic address resolution against a live-structure snapshot.
//!
//! The resolver never talks to the network. Callers hand it the structure
//! fetched once for the batch window and get concrete [`GridRange`]s back.

use crate::error::ResolutionError;
use crate::intent::RangeSpec;
use crate::structure::{LiveStructure, SheetInfo};
use serde::{Deserialize, Serialize};
use sheetgate_common::{A1Ref, GridRange, parse_a1};

/// What to do when a header text appears more than once in the first row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateHeaderPolicy {
    /// Leftmost match wins; a warning is logged.
    #[default]
    FirstMatch,
    /// Rightmost match wins; a warning is logged.
    LastMatch,
    /// Fail with `AmbiguousHeader`.
    Reject,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RangeResolver {
    duplicate_headers: DuplicateHeaderPolicy,
}

impl RangeResolver {
    pub fn new(duplicate_headers: DuplicateHeaderPolicy) -> Self {
        Self { duplicate_headers }
    }

    pub fn duplicate_headers(&self) -> DuplicateHeaderPolicy {
        self.duplicate_headers
    }

    /// Resolve `spec` to a range inside the current extent of its sheet.
    pub fn resolve(
        &self,
        object_id: &str,
        spec: &RangeSpec,
        structure: &LiveStructure,
    ) -> Result<GridRange, ResolutionError> {
        let (sheet, rows, cols) = self.spans(object_id, spec, structure)?;
        let (sr, er) = match rows {
            Some(rows) => rows,
            None => (0, sheet.row_count.max(1) - 1),
        };
        let (sc, ec) = match cols {
            Some(cols) => cols,
            None => (0, sheet.col_count.max(1) - 1),
        };
        let range = ordered(sheet, sr, sc, er, ec)?;
        if sheet.row_count > 0
            && sheet.col_count > 0
            && (range.end_row >= sheet.row_count || range.end_col >= sheet.col_count)
        {
            return Err(out_of_bounds(sheet, &range));
        }
        Ok(range)
    }

    /// Range that `height` x `width` appended rows occupy: the rows directly
    /// below the sheet's current extent, starting at the first column `spec`
    /// names. `row_offset` skips rows already claimed by earlier appends.
    pub fn resolve_append(
        &self,
        object_id: &str,
        spec: &RangeSpec,
        structure: &LiveStructure,
        height: u32,
        width: u32,
        row_offset: u32,
    ) -> Result<GridRange, ResolutionError> {
        let (sheet, _, cols) = self.spans(object_id, spec, structure)?;
        let start_col = cols.map_or(0, |(sc, _)| sc);
        let start_row = sheet.row_count.saturating_add(row_offset);
        ordered(
            sheet,
            start_row,
            start_col,
            start_row.saturating_add(height.max(1) - 1),
            start_col.saturating_add(width.max(1) - 1),
        )
    }

    /// Sheet targeted by `spec` without computing bounds.
    pub fn sheet<'s>(
        &self,
        object_id: &str,
        spec: &RangeSpec,
        structure: &'s LiveStructure,
    ) -> Result<&'s SheetInfo, ResolutionError> {
        match spec {
            RangeSpec::Grid { sheet, .. } | RangeSpec::Semantic { sheet, .. } => {
                find_sheet(object_id, structure, sheet)
            }
            RangeSpec::A1 { a1 } => {
                let parsed = parse(a1)?;
                match parsed.sheet.as_deref() {
                    Some(title) => find_sheet(object_id, structure, title),
                    None => first_sheet(object_id, structure),
                }
            }
            RangeSpec::Named { name } => {
                let def = structure.named_range(name).ok_or_else(|| {
                    ResolutionError::NamedRangeNotFound { name: name.clone() }
                })?;
                structure
                    .sheet(def.range.sheet_id)
                    .ok_or_else(|| ResolutionError::SheetNotFound {
                        object_id: object_id.to_string(),
                        sheet: format!("#{}", def.range.sheet_id),
                    })
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn spans<'s>(
        &self,
        object_id: &str,
        spec: &RangeSpec,
        structure: &'s LiveStructure,
    ) -> Result<(&'s SheetInfo, Option<(u32, u32)>, Option<(u32, u32)>), ResolutionError> {
        let sheet = self.sheet(object_id, spec, structure)?;
        match spec {
            RangeSpec::Grid { rows, cols, .. } => Ok((sheet, *rows, *cols)),
            RangeSpec::A1 { a1 } => {
                let parsed = parse(a1)?;
                Ok((sheet, parsed.rows(), parsed.cols()))
            }
            RangeSpec::Named { name } => {
                // `sheet()` already proved the name exists.
                let def = structure
                    .named_range(name)
                    .ok_or_else(|| ResolutionError::NamedRangeNotFound { name: name.clone() })?;
                let r = def.range;
                Ok((
                    sheet,
                    Some((r.start_row, r.end_row)),
                    Some((r.start_col, r.end_col)),
                ))
            }
            RangeSpec::Semantic {
                header,
                include_header,
                ..
            } => {
                let col = self.header_column(sheet, header)?;
                let first = if *include_header { 0 } else { 1 };
                let last = sheet.row_count.max(1) - 1;
                if first > last {
                    let range = GridRange::cell(sheet.sheet_id, first, col);
                    return Err(out_of_bounds(sheet, &range));
                }
                Ok((sheet, Some((first, last)), Some((col, col))))
            }
        }
    }

    fn header_column(&self, sheet: &SheetInfo, header: &str) -> Result<u32, ResolutionError> {
        let wanted = header.trim().to_lowercase();
        let matches: Vec<u32> = sheet
            .header_row
            .iter()
            .enumerate()
            .filter(|(_, h)| h.trim().to_lowercase() == wanted)
            .map(|(i, _)| i as u32)
            .collect();

        match matches.as_slice() {
            [] => Err(ResolutionError::HeaderNotFound {
                sheet: sheet.title.clone(),
                header: header.to_string(),
            }),
            [only] => Ok(*only),
            [first, .., last] => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    sheet = %sheet.title,
                    header,
                    count = matches.len(),
                    policy = ?self.duplicate_headers,
                    "duplicate header"
                );
                match self.duplicate_headers {
                    DuplicateHeaderPolicy::FirstMatch => Ok(*first),
                    DuplicateHeaderPolicy::LastMatch => Ok(*last),
                    DuplicateHeaderPolicy::Reject => Err(ResolutionError::AmbiguousHeader {
                        sheet: sheet.title.clone(),
                        header: header.to_string(),
                        count: matches.len(),
                    }),
                }
            }
        }
    }
}

fn parse(a1: &str) -> Result<A1Ref, ResolutionError> {
    parse_a1(a1).map_err(|source| ResolutionError::InvalidAddress {
        input: a1.to_string(),
        source,
    })
}

fn find_sheet<'s>(
    object_id: &str,
    structure: &'s LiveStructure,
    title: &str,
) -> Result<&'s SheetInfo, ResolutionError> {
    structure
        .sheet_by_title(title)
        .ok_or_else(|| ResolutionError::SheetNotFound {
            object_id: object_id.to_string(),
            sheet: title.to_string(),
        })
}

fn first_sheet<'s>(
    object_id: &str,
    structure: &'s LiveStructure,
) -> Result<&'s SheetInfo, ResolutionError> {
    structure
        .sheets
        .first()
        .ok_or_else(|| ResolutionError::SheetNotFound {
            object_id: object_id.to_string(),
            sheet: "<first sheet>".to_string(),
        })
}

fn ordered(
    sheet: &SheetInfo,
    sr: u32,
    sc: u32,
    er: u32,
    ec: u32,
) -> Result<GridRange, ResolutionError> {
    GridRange::new(sheet.sheet_id, sr, sc, er, ec).map_err(|e| ResolutionError::OutOfBounds {
        sheet: sheet.title.clone(),
        range: e.to_string(),
        rows: sheet.row_count,
        cols: sheet.col_count,
    })
}

fn out_of_bounds(sheet: &SheetInfo, range: &GridRange) -> ResolutionError {
    ResolutionError::OutOfBounds {
        sheet: sheet.title.clone(),
        range: range.to_a1(),
        rows: sheet.row_count,
        cols: sheet.col_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolutionErrorKind;
    use crate::structure::NamedRangeDef;

    fn structure() -> LiveStructure {
        LiveStructure {
            object_id: "obj".into(),
            title: "Book".into(),
            sheets: vec![
                SheetInfo {
                    sheet_id: 10,
                    title: "Data".into(),
                    row_count: 100,
                    col_count: 5,
                    header_row: vec![
                        "Name".into(),
                        "Revenue".into(),
                        "Cost".into(),
                        "revenue".into(),
                    ],
                },
                SheetInfo {
                    sheet_id: 11,
                    title: "Q1 Summary".into(),
                    row_count: 10,
                    col_count: 3,
                    header_row: vec![],
                },
            ],
            named_ranges: vec![NamedRangeDef {
                name: "Totals".into(),
                range: GridRange::new(11, 1, 0, 4, 2).unwrap(),
            }],
        }
    }

    fn resolve(spec: RangeSpec) -> Result<GridRange, ResolutionError> {
        RangeResolver::default().resolve("obj", &spec, &structure())
    }

    #[test]
    fn named_range_exact_lookup() {
        assert_eq!(
            resolve(RangeSpec::named("Totals")).unwrap(),
            GridRange::new(11, 1, 0, 4, 2).unwrap()
        );
        let err = resolve(RangeSpec::named("totals")).unwrap_err();
        assert_eq!(err.kind(), ResolutionErrorKind::NotFound);
    }

    #[test]
    fn header_match_is_case_insensitive_and_skips_header_row() {
        let got = resolve(RangeSpec::column("Data", "COST")).unwrap();
        assert_eq!(got, GridRange::new(10, 1, 2, 99, 2).unwrap());

        let with_header = resolve(RangeSpec::Semantic {
            sheet: "Data".into(),
            header: "cost".into(),
            include_header: true,
        })
        .unwrap();
        assert_eq!(with_header.start_row, 0);
    }

    #[test]
    fn duplicate_header_follows_policy() {
        let s = structure();
        let spec = RangeSpec::column("Data", "Revenue");
        let first = RangeResolver::new(DuplicateHeaderPolicy::FirstMatch)
            .resolve("obj", &spec, &s)
            .unwrap();
        assert_eq!(first.start_col, 1);
        let last = RangeResolver::new(DuplicateHeaderPolicy::LastMatch)
            .resolve("obj", &spec, &s)
            .unwrap();
        assert_eq!(last.start_col, 3);
        let err = RangeResolver::new(DuplicateHeaderPolicy::Reject)
            .resolve("obj", &spec, &s)
            .unwrap_err();
        assert_eq!(err.kind(), ResolutionErrorKind::AmbiguousHeader);
    }

    #[test]
    fn missing_header_is_an_error() {
        let err = resolve(RangeSpec::column("Data", "Margin")).unwrap_err();
        assert_eq!(err.kind(), ResolutionErrorKind::HeaderNotFound);
    }

    #[test]
    fn a1_with_quoted_sheet_and_open_axes() {
        assert_eq!(
            resolve(RangeSpec::a1("'Q1 Summary'!B2:C3")).unwrap(),
            GridRange::new(11, 1, 1, 2, 2).unwrap()
        );
        assert_eq!(
            resolve(RangeSpec::a1("Data!A:B")).unwrap(),
            GridRange::new(10, 0, 0, 99, 1).unwrap()
        );
        assert_eq!(
            resolve(RangeSpec::a1("Data")).unwrap(),
            GridRange::whole_sheet(10, 100, 5)
        );
        // No sheet prefix targets the first sheet.
        assert_eq!(resolve(RangeSpec::a1("A1")).unwrap(), GridRange::cell(10, 0, 0));
    }

    #[test]
    fn bounds_are_checked() {
        let err = resolve(RangeSpec::a1("Data!A1:Z5")).unwrap_err();
        assert_eq!(err.kind(), ResolutionErrorKind::OutOfBounds);
        let err = resolve(RangeSpec::a1("Nope!A1")).unwrap_err();
        assert_eq!(err.kind(), ResolutionErrorKind::SheetNotFound);
    }

    #[test]
    fn appends_land_below_the_extent() {
        let s = structure();
        let r = RangeResolver::default();
        let spec = RangeSpec::column("Data", "Revenue");
        let got = r.resolve_append("obj", &spec, &s, 2, 3, 0).unwrap();
        assert_eq!(got, GridRange::new(10, 100, 1, 101, 3).unwrap());
        let stacked = r.resolve_append("obj", &spec, &s, 1, 1, 2).unwrap();
        assert_eq!(stacked.start_row, 102);
    }
}
