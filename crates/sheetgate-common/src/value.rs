use chrono::NaiveDate;
use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Value held by (or written to) one backend cell.
///
/// `Formula` keeps the expression next to the value the backend last rendered
/// for it; comparisons that matter for diffs and preconditions go through
/// [`CellValue::rendered`], never through the formula text.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", content = "value"))]
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Int(i64),
    Number(f64),
    Text(String),
    Boolean(bool),
    Date(NaiveDate),
    Error(String),
    Formula {
        formula: String,
        cached: Box<CellValue>,
    },
}

impl Hash for CellValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            CellValue::Empty => state.write_u8(0),
            CellValue::Int(i) => i.hash(state),
            CellValue::Number(n) => n.to_bits().hash(state),
            CellValue::Text(s) => s.hash(state),
            CellValue::Boolean(b) => b.hash(state),
            CellValue::Date(d) => d.hash(state),
            CellValue::Error(e) => e.hash(state),
            CellValue::Formula { formula, cached } => {
                formula.hash(state);
                cached.hash(state);
            }
        }
    }
}

impl Eq for CellValue {}

impl Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered())
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Int(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Boolean(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

fn render_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl CellValue {
    pub fn formula(formula: impl Into<String>, cached: CellValue) -> Self {
        CellValue::Formula {
            formula: formula.into(),
            cached: Box::new(cached),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    /// The value a user sees in the cell.
    pub fn rendered(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Int(i) => i.to_string(),
            CellValue::Number(n) => render_number(*n),
            CellValue::Text(s) => s.clone(),
            CellValue::Boolean(true) => "TRUE".to_string(),
            CellValue::Boolean(false) => "FALSE".to_string(),
            CellValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            CellValue::Error(code) => code.clone(),
            CellValue::Formula { cached, .. } => cached.rendered(),
        }
    }

    /// Underlying value with any formula stripped.
    pub fn unformatted(&self) -> CellValue {
        match self {
            CellValue::Formula { cached, .. } => cached.unformatted(),
            other => other.clone(),
        }
    }

    /// Project the cell the way a backend read with `mode` reports it.
    pub fn render_as(&self, mode: RenderMode) -> CellValue {
        match mode {
            RenderMode::Formatted => {
                if self.is_empty() {
                    CellValue::Empty
                } else {
                    CellValue::Text(self.rendered())
                }
            }
            RenderMode::Unformatted => self.unformatted(),
            RenderMode::Formula => match self {
                CellValue::Formula { formula, .. } => CellValue::Text(formula.clone()),
                other => other.clone(),
            },
        }
    }

    /// Rough in-memory footprint, used for cache accounting.
    pub fn approx_bytes(&self) -> usize {
        let base = std::mem::size_of::<CellValue>();
        match self {
            CellValue::Text(s) | CellValue::Error(s) => base + s.len(),
            CellValue::Formula { formula, cached } => base + formula.len() + cached.approx_bytes(),
            _ => base,
        }
    }
}

/// How values are rendered by a read.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum RenderMode {
    #[default]
    Formatted,
    Unformatted,
    Formula,
}

/// Row-major block of cell values anchored at a range's top-left corner.
///
/// Rows may be ragged or shorter than the range (backends trim trailing
/// empties); missing cells read as [`CellValue::Empty`].
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Grid {
    pub rows: Vec<Vec<CellValue>>,
}

static EMPTY: CellValue = CellValue::Empty;

impl Grid {
    pub fn new(rows: Vec<Vec<CellValue>>) -> Self {
        Self { rows }
    }

    pub fn filled(height: usize, width: usize, value: CellValue) -> Self {
        Self {
            rows: vec![vec![value; width]; height],
        }
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn cell_count(&self) -> usize {
        self.height() * self.width()
    }

    pub fn get(&self, row: usize, col: usize) -> &CellValue {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&EMPTY)
    }

    pub fn set(&mut self, row: usize, col: usize, value: CellValue) {
        if self.rows.len() <= row {
            self.rows.resize_with(row + 1, Vec::new);
        }
        let r = &mut self.rows[row];
        if r.len() <= col {
            r.resize(col + 1, CellValue::Empty);
        }
        r[col] = value;
    }

    /// Copy of the first `max_rows` rows.
    pub fn head(&self, max_rows: usize) -> Grid {
        Grid {
            rows: self.rows.iter().take(max_rows).cloned().collect(),
        }
    }

    /// Paste `other` with its top-left corner at (`row`, `col`).
    pub fn overlay(&mut self, row: usize, col: usize, other: &Grid) {
        for (dr, values) in other.rows.iter().enumerate() {
            for (dc, value) in values.iter().enumerate() {
                self.set(row + dr, col + dc, value.clone());
            }
        }
    }

    /// Sub-block of `height` x `width` cells starting at (`row`, `col`).
    pub fn slice(&self, row: usize, col: usize, height: usize, width: usize) -> Grid {
        let mut rows = Vec::with_capacity(height);
        for r in row..row + height {
            let mut out = Vec::with_capacity(width);
            for c in col..col + width {
                out.push(self.get(r, c).clone());
            }
            rows.push(out);
        }
        Grid { rows }
    }

    pub fn approx_bytes(&self) -> usize {
        self.rows
            .iter()
            .map(|r| {
                std::mem::size_of::<Vec<CellValue>>()
                    + r.iter().map(CellValue::approx_bytes).sum::<usize>()
            })
            .sum::<usize>()
            + std::mem::size_of::<Grid>()
    }
}

impl From<Vec<Vec<CellValue>>> for Grid {
    fn from(rows: Vec<Vec<CellValue>>) -> Self {
        Grid { rows }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_ignores_formula_text() {
        let a = CellValue::formula("=1+1", CellValue::Number(2.0));
        let b = CellValue::formula("=4/2", CellValue::Int(2));
        assert_ne!(a, b);
        assert_eq!(a.rendered(), b.rendered());
        assert_eq!(a.rendered(), "2");
    }

    #[test]
    fn render_modes() {
        let f = CellValue::formula("=SUM(A1:A2)", CellValue::Number(1.5));
        assert_eq!(f.render_as(RenderMode::Formatted), CellValue::Text("1.5".into()));
        assert_eq!(f.render_as(RenderMode::Unformatted), CellValue::Number(1.5));
        assert_eq!(
            f.render_as(RenderMode::Formula),
            CellValue::Text("=SUM(A1:A2)".into())
        );
        assert_eq!(CellValue::Boolean(true).rendered(), "TRUE");
    }

    #[test]
    fn grid_reads_missing_cells_as_empty() {
        let mut g = Grid::new(vec![vec![CellValue::Int(1)]]);
        assert_eq!(g.get(3, 3), &CellValue::Empty);
        g.set(2, 1, "x".into());
        assert_eq!(g.height(), 3);
        assert_eq!(g.width(), 2);
        assert_eq!(g.get(2, 1).rendered(), "x");
    }

    #[test]
    fn overlay_and_slice() {
        let mut g = Grid::filled(3, 3, CellValue::Int(0));
        g.overlay(1, 1, &Grid::new(vec![vec![CellValue::Int(9), CellValue::Int(8)]]));
        let s = g.slice(1, 1, 1, 2);
        assert_eq!(s.rows, vec![vec![CellValue::Int(9), CellValue::Int(8)]]);
        assert_eq!(g.head(1).height(), 1);
    }
}
