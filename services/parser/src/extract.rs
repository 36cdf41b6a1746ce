//! Sheet Extractor: reads one configured region of a workbook into a raw table.
//!
//! Cells are mapped strictly by configured column position; everything
//! between or outside the mapped columns is ignored.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Range, Reader, Sheets};
use tracing::debug;

use crate::config::FamilyConfig;
use crate::error::{Error, Result};

/// Entity-cell labels that identify a header row when probing.
const HEADER_LABELS: &[&str] = &["concepto", "instituci", "entidad"];

/// Untyped cell value as read from the sheet.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Empty,
    Text(String),
    Number(f64),
}

impl RawValue {
    pub fn is_empty(&self) -> bool {
        match self {
            RawValue::Empty => true,
            RawValue::Text(s) => s.trim().is_empty(),
            RawValue::Number(_) => false,
        }
    }
}

impl From<&Data> for RawValue {
    fn from(cell: &Data) -> Self {
        match cell {
            Data::Empty | Data::Error(_) => RawValue::Empty,
            Data::Int(i) => RawValue::Number(*i as f64),
            Data::Float(f) => RawValue::Number(*f),
            Data::String(s) => RawValue::Text(s.clone()),
            other => RawValue::Text(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// 1-based sheet row the values came from.
    pub row: u32,
    pub values: Vec<RawValue>,
}

/// Output of the extractor: rows keyed positionally by `columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    pub family: String,
    pub sheet: String,
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
}

/// Anything that can hand out named sheet ranges.
pub trait SheetSource {
    /// File identity used for period tagging and error attribution.
    fn path(&self) -> &Path;

    fn sheet_names(&self) -> Vec<String>;

    fn range(&mut self, sheet: &str) -> Result<Range<Data>>;
}

/// A workbook on disk (xlsx, xls, xlsb or ods).
pub struct Workbook {
    path: PathBuf,
    sheets: Sheets<BufReader<File>>,
}

impl Workbook {
    pub fn open(path: &Path) -> Result<Self> {
        let sheets = open_workbook_auto(path)
            .map_err(|e| Error::source_format(path, "*", format!("cannot open workbook: {}", e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            sheets,
        })
    }
}

impl SheetSource for Workbook {
    fn path(&self) -> &Path {
        &self.path
    }

    fn sheet_names(&self) -> Vec<String> {
        self.sheets.sheet_names()
    }

    fn range(&mut self, sheet: &str) -> Result<Range<Data>> {
        self.sheets
            .worksheet_range(sheet)
            .map_err(|e| Error::source_format(&self.path, sheet, e.to_string()))
    }
}

/// Sheets held in memory, mostly for tests and fixtures.
#[derive(Debug, Clone, Default)]
pub struct InMemorySheets {
    path: PathBuf,
    sheets: Vec<(String, Range<Data>)>,
}

impl InMemorySheets {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sheets: Vec::new(),
        }
    }

    /// Add a sheet whose first row is sheet row 1 and first column is A.
    pub fn with_sheet(mut self, name: &str, rows: Vec<Vec<Data>>) -> Self {
        let height = rows.len() as u32;
        let width = rows.iter().map(|r| r.len()).max().unwrap_or(0) as u32;
        let range = if height == 0 || width == 0 {
            Range::empty()
        } else {
            let mut range = Range::new((0, 0), (height - 1, width - 1));
            for (r, row) in rows.into_iter().enumerate() {
                for (c, cell) in row.into_iter().enumerate() {
                    range.set_value((r as u32, c as u32), cell);
                }
            }
            range
        };
        self.sheets.push((name.to_string(), range));
        self
    }
}

impl SheetSource for InMemorySheets {
    fn path(&self) -> &Path {
        &self.path
    }

    fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|(name, _)| name.clone()).collect()
    }

    fn range(&mut self, sheet: &str) -> Result<Range<Data>> {
        self.sheets
            .iter()
            .find(|(name, _)| name == sheet)
            .map(|(_, range)| range.clone())
            .ok_or_else(|| Error::source_format(&self.path, sheet, "sheet not found"))
    }
}

/// Extract one family's table from a source.
///
/// `header_override` forces a header row instead of probing the configured
/// candidates.
pub fn extract_family<S: SheetSource + ?Sized>(
    source: &mut S,
    family: &FamilyConfig,
    header_override: Option<u32>,
) -> Result<RawTable> {
    let path = source.path().to_path_buf();
    let available = source.sheet_names();
    let sheet = family
        .sheets
        .iter()
        .find(|candidate| available.iter().any(|name| name == *candidate))
        .ok_or_else(|| {
            Error::source_format(
                &path,
                family.sheets.join("|"),
                format!("none of the sheets is present (workbook has {:?})", available),
            )
        })?
        .clone();

    let range = source.range(&sheet)?;
    let (end_row, end_col) = range
        .end()
        .ok_or_else(|| Error::source_format(&path, &sheet, "sheet is empty"))?;

    let mut indices = Vec::with_capacity(family.columns.len());
    for col in &family.columns {
        let idx = col
            .index()
            .map_err(|e| Error::source_format(&path, &sheet, e.to_string()))?;
        if idx > end_col {
            return Err(Error::source_format(
                &path,
                &sheet,
                format!("column {} ({}) is outside the used range", col.column, col.field),
            ));
        }
        indices.push(idx);
    }

    let header_row = match header_override {
        Some(row) => row,
        None => detect_header_row(&range, indices[0], &family.header_rows),
    };
    debug!(family = %family.name, sheet = %sheet, header_row, "extracting");

    // header_row is 1-based, so it is also the 0-based index of the first data row.
    let mut rows = Vec::new();
    for abs_row in header_row..=end_row {
        let values: Vec<RawValue> = indices
            .iter()
            .map(|&col| {
                range
                    .get_value((abs_row, col))
                    .map(RawValue::from)
                    .unwrap_or(RawValue::Empty)
            })
            .collect();
        if values.iter().all(RawValue::is_empty) {
            continue;
        }
        rows.push(RawRow {
            row: abs_row + 1,
            values,
        });
    }

    Ok(RawTable {
        family: family.name.clone(),
        sheet,
        columns: family.columns.iter().map(|c| c.field.clone()).collect(),
        rows,
    })
}

/// Pick the first candidate whose entity cell reads like a header label.
fn detect_header_row(range: &Range<Data>, entity_col: u32, candidates: &[u32]) -> u32 {
    candidates
        .iter()
        .copied()
        .find(|&row| match range.get_value((row.saturating_sub(1), entity_col)) {
            Some(Data::String(s)) => {
                let lower = s.to_lowercase();
                HEADER_LABELS.iter().any(|label| lower.contains(label))
            }
            _ => false,
        })
        .or_else(|| candidates.first().copied())
        .unwrap_or(1)
}
