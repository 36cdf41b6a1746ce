//! Period Tagger: the reporting month comes from the file name, never the content.

use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;

use crate::clean::{CleanRow, CleanTable};
use crate::error::{Error, Result};

pub const DEFAULT_PERIODICITY: &str = "Mensual";

fn period_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Year and month may be separated by "_", "-", a space, or nothing
    // ("BE BM 202506.xlsx").
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:^|\D)((?:19|20)\d{2})[_\- ]?(\d{2})(?:\D|$)").expect("static regex")
    })
}

/// First day of the month encoded in the file name.
pub fn period_from_path(path: &Path) -> Result<NaiveDate> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    // Matches may overlap ("2023_2024_01"), so retry from every offset.
    let mut start = 0;
    while let Some(caps) = period_pattern().captures_at(&name, start) {
        let year: i32 = caps[1].parse().unwrap_or(0);
        let month: u32 = caps[2].parse().unwrap_or(0);
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, 1) {
            return Ok(date);
        }
        start = caps.get(1).map(|m| m.start() + 1).unwrap_or(name.len());
    }

    Err(Error::PeriodFormat {
        file: path.to_path_buf(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedRow {
    pub period: NaiveDate,
    pub entity: String,
    pub values: Vec<f64>,
    pub periodicity: String,
    /// Absent on tables written before ingestion stamps existed.
    pub ingested_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedTable {
    pub family: String,
    pub fields: Vec<String>,
    pub rows: Vec<TaggedRow>,
}

/// Run-wide stamp applied to every tagged row.
#[derive(Debug, Clone)]
pub struct TagContext {
    pub periodicity: String,
    pub ingested_at: DateTime<Utc>,
}

impl TagContext {
    pub fn now() -> Self {
        Self {
            periodicity: DEFAULT_PERIODICITY.to_string(),
            ingested_at: Utc::now(),
        }
    }
}

/// Stamp every row of a clean table with the file's period.
pub fn tag_table(table: CleanTable, file: &Path, ctx: &TagContext) -> Result<TaggedTable> {
    let period = period_from_path(file)?;
    let rows = table
        .rows
        .into_iter()
        .map(|CleanRow { entity, values, .. }| TaggedRow {
            period,
            entity,
            values,
            periodicity: ctx.periodicity.clone(),
            ingested_at: Some(ctx.ingested_at),
        })
        .collect();
    Ok(TaggedTable {
        family: table.family,
        fields: table.fields,
        rows,
    })
}
