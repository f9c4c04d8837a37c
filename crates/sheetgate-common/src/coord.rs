//! Column-letter conversion and A1 notation parsing.
//!
//! All indices produced here are zero-based. Bounds that the notation leaves
//! open (`A:C` has no rows, `2:5` has no columns, a bare sheet title has
//! neither) are reported as `None` so the resolver can fill them from the live
//! sheet extent.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Largest row index accepted from A1 text (Sheets caps grids at 10M cells, rows stay well below this).
pub const MAX_ROW: u32 = 10_000_000;
/// Largest column index accepted from A1 text (`ZZZ`).
pub const MAX_COL: u32 = 18_277;

/// Errors returned while parsing A1 notation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum A1ParseError {
    Empty,
    UnterminatedQuote,
    InvalidCell(String),
    MixedAxes(String),
    RowOverflow(u64),
    ColOverflow(String),
}

impl fmt::Display for A1ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            A1ParseError::Empty => write!(f, "empty A1 reference"),
            A1ParseError::UnterminatedQuote => write!(f, "unterminated quoted sheet name"),
            A1ParseError::InvalidCell(s) => write!(f, "`{s}` is not a valid A1 cell"),
            A1ParseError::MixedAxes(s) => {
                write!(f, "`{s}` mixes a whole-row bound with a whole-column bound")
            }
            A1ParseError::RowOverflow(row) => write!(f, "row {row} exceeds {MAX_ROW}"),
            A1ParseError::ColOverflow(col) => write!(f, "column `{col}` exceeds {MAX_COL}"),
        }
    }
}

impl std::error::Error for A1ParseError {}

/// Zero-based column index to letters (`0 -> A`, `27 -> AB`).
pub fn col_to_letters(mut col: u32) -> String {
    let mut buf = Vec::new();
    loop {
        let rem = (col % 26) as u8;
        buf.push(b'A' + rem);
        col /= 26;
        if col == 0 {
            break;
        }
        col -= 1;
    }
    buf.reverse();
    buf.into_iter().map(char::from).collect()
}

/// Letters to zero-based column index. Lowercase is accepted.
pub fn letters_to_col(s: &str) -> Option<u32> {
    if s.is_empty() {
        return None;
    }
    let mut col: u32 = 0;
    for (idx, ch) in s.bytes().enumerate() {
        let ch = ch.to_ascii_uppercase();
        if !ch.is_ascii_uppercase() {
            return None;
        }
        let val = (ch - b'A') as u32;
        col = col.checked_mul(26)?;
        col = col.checked_add(val)?;
        if idx != s.len() - 1 {
            col = col.checked_add(1)?;
        }
    }
    Some(col)
}

/// One endpoint of an A1 range. Either axis may be open.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct A1Bound {
    pub row: Option<u32>,
    pub col: Option<u32>,
}

/// Parsed A1 reference with an optional sheet title.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct A1Ref {
    pub sheet: Option<String>,
    pub start: Option<A1Bound>,
    pub end: Option<A1Bound>,
}

impl A1Ref {
    /// True when only a sheet title was given.
    pub fn is_whole_sheet(&self) -> bool {
        self.start.is_none()
    }

    /// Row span, `None` when the reference leaves rows open.
    pub fn rows(&self) -> Option<(u32, u32)> {
        let start = self.start?;
        let end = self.end.unwrap_or(start);
        Some((start.row?, end.row?))
    }

    /// Column span, `None` when the reference leaves columns open.
    pub fn cols(&self) -> Option<(u32, u32)> {
        let start = self.start?;
        let end = self.end.unwrap_or(start);
        Some((start.col?, end.col?))
    }
}

fn parse_bound(text: &str) -> Result<A1Bound, A1ParseError> {
    let cleaned: String = text.chars().filter(|c| *c != '$').collect();
    if cleaned.is_empty() {
        return Err(A1ParseError::InvalidCell(text.to_string()));
    }
    let split = cleaned
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(cleaned.len());
    let (letters, digits) = cleaned.split_at(split);
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(A1ParseError::InvalidCell(text.to_string()));
    }
    let col = if letters.is_empty() {
        None
    } else {
        let col =
            letters_to_col(letters).ok_or_else(|| A1ParseError::InvalidCell(text.to_string()))?;
        if col > MAX_COL {
            return Err(A1ParseError::ColOverflow(letters.to_string()));
        }
        Some(col)
    };
    let row = if digits.is_empty() {
        None
    } else {
        let one_based: u64 = digits
            .parse()
            .map_err(|_| A1ParseError::InvalidCell(text.to_string()))?;
        if one_based == 0 {
            return Err(A1ParseError::InvalidCell(text.to_string()));
        }
        if one_based - 1 > u64::from(MAX_ROW) {
            return Err(A1ParseError::RowOverflow(one_based));
        }
        Some((one_based - 1) as u32)
    };
    Ok(A1Bound { row, col })
}

fn split_sheet(input: &str) -> Result<(Option<String>, &str), A1ParseError> {
    if let Some(rest) = input.strip_prefix('\'') {
        // Quoted titles escape an embedded quote as ''.
        let mut title = String::new();
        let mut chars = rest.char_indices().peekable();
        while let Some((idx, ch)) = chars.next() {
            if ch == '\'' {
                if matches!(chars.peek(), Some((_, '\''))) {
                    title.push('\'');
                    chars.next();
                    continue;
                }
                let tail = &rest[idx + 1..];
                return match tail.strip_prefix('!') {
                    Some(cells) => Ok((Some(title), cells)),
                    None if tail.is_empty() => Ok((Some(title), "")),
                    None => Err(A1ParseError::InvalidCell(input.to_string())),
                };
            }
            title.push(ch);
        }
        return Err(A1ParseError::UnterminatedQuote);
    }
    match input.rsplit_once('!') {
        Some((sheet, cells)) => Ok((Some(sheet.to_string()), cells)),
        None => Ok((None, input)),
    }
}

/// Parse `Sheet1!A1:B10`, `'My Sheet'!A:A`, `2:5`, `B3`, or a bare sheet title.
///
/// A bare token that does not parse as a cell is treated as a sheet title, so
/// `Summary` resolves to the whole `Summary` sheet.
pub fn parse_a1(input: &str) -> Result<A1Ref, A1ParseError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(A1ParseError::Empty);
    }
    let (sheet, cells) = split_sheet(input)?;
    if cells.is_empty() {
        return match sheet {
            Some(sheet) => Ok(A1Ref {
                sheet: Some(sheet),
                start: None,
                end: None,
            }),
            None => Err(A1ParseError::Empty),
        };
    }

    let (start_text, end_text) = match cells.split_once(':') {
        Some((a, b)) => (a, Some(b)),
        None => (cells, None),
    };
    let bare_token = sheet.is_none() && end_text.is_none();
    let start = match parse_bound(start_text) {
        Ok(bound) if bound.row.is_some() && bound.col.is_some() => bound,
        Ok(bound) if end_text.is_some() => bound,
        _ if bare_token => {
            return Ok(A1Ref {
                sheet: Some(cells.to_string()),
                start: None,
                end: None,
            });
        }
        Ok(_) => return Err(A1ParseError::InvalidCell(cells.to_string())),
        Err(err) => return Err(err),
    };
    let end = end_text.map(parse_bound).transpose()?;

    if let Some(end) = end {
        let start_whole_col = start.row.is_none();
        let end_whole_col = end.row.is_none();
        let start_whole_row = start.col.is_none();
        let end_whole_row = end.col.is_none();
        if start_whole_col != end_whole_col || start_whole_row != end_whole_row {
            return Err(A1ParseError::MixedAxes(cells.to_string()));
        }
    }

    Ok(A1Ref {
        sheet,
        start: Some(start),
        end,
    })
}

/// Render zero-based bounds as A1 (`0,0,9,1 -> A1:B10`).
pub fn format_a1(start_row: u32, start_col: u32, end_row: u32, end_col: u32) -> String {
    let start = format!("{}{}", col_to_letters(start_col), start_row + 1);
    if start_row == end_row && start_col == end_col {
        return start;
    }
    format!("{start}:{}{}", col_to_letters(end_col), end_row + 1)
}

/// Quote a sheet title when A1 requires it.
pub fn quote_sheet_title(title: &str) -> String {
    let plain = !title.is_empty()
        && title
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !title.chars().next().is_some_and(|c| c.is_ascii_digit());
    if plain {
        title.to_string()
    } else {
        format!("'{}'", title.replace('\'', "''"))
    }
}
