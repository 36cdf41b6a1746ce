//! Consolidator: one ordered table per family across all input files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use tracing::debug;

use crate::clean::coerce_number;
use crate::config::{FamilyConfig, FamilyRegistry, ENTITY_FIELD};
use crate::error::{Error, Result};
use crate::extract::RawValue;
use crate::period::{TaggedRow, TaggedTable, DEFAULT_PERIODICITY};

pub const PERIOD_COLUMN: &str = "Fecha";
pub const PERIODICITY_COLUMN: &str = "Periodicidad";
pub const INGESTED_AT_COLUMN: &str = "FechaIngesta";

const FILE_PREFIX: &str = "consolidated_data_";

fn file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^consolidated_data_(\w+)\.csv$").expect("static regex"))
}

/// All tagged rows of one family, file order then row order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidatedTable {
    pub family: String,
    pub fields: Vec<String>,
    pub rows: Vec<TaggedRow>,
}

/// Concatenate the tagged tables of one family.
///
/// Returns `Ok(None)` when no file contributed a row; the caller decides
/// whether that is an error.
pub fn consolidate(
    family: &FamilyConfig,
    tables: Vec<TaggedTable>,
) -> Result<Option<ConsolidatedTable>> {
    let fields: Vec<String> = family.value_fields().map(str::to_string).collect();
    let mut rows = Vec::new();

    for table in tables {
        if table.family != family.name {
            return Err(Error::mapping(
                &family.name,
                format!("refusing to merge rows of family '{}'", table.family),
            ));
        }
        if table.fields != fields {
            return Err(Error::mapping(
                &family.name,
                format!("fields {:?} differ from configured {:?}", table.fields, fields),
            ));
        }
        rows.extend(table.rows);
    }

    if rows.is_empty() {
        return Ok(None);
    }
    debug!(family = %family.name, rows = rows.len(), "consolidated");
    Ok(Some(ConsolidatedTable {
        family: family.name.clone(),
        fields,
        rows,
    }))
}

impl ConsolidatedTable {
    pub fn file_name(family: &str) -> String {
        format!("{}{}.csv", FILE_PREFIX, family)
    }

    /// Column headers in output order.
    pub fn columns(&self) -> Vec<String> {
        let mut columns = vec![PERIOD_COLUMN.to_string(), ENTITY_FIELD.to_string()];
        columns.extend(self.fields.iter().cloned());
        columns.push(PERIODICITY_COLUMN.to_string());
        columns.push(INGESTED_AT_COLUMN.to_string());
        columns
    }

    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == field)
    }

    /// (period, entity) pairs seen more than once, in first-seen order.
    pub fn duplicate_keys(&self) -> Vec<(NaiveDate, String)> {
        let mut counts: HashMap<(NaiveDate, &str), usize> = HashMap::new();
        let mut order = Vec::new();
        for row in &self.rows {
            let count = counts.entry((row.period, row.entity.as_str())).or_insert(0);
            *count += 1;
            if *count == 2 {
                order.push((row.period, row.entity.clone()));
            }
        }
        order
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(self.columns())?;
        for row in &self.rows {
            let mut record = Vec::with_capacity(self.fields.len() + 4);
            record.push(row.period.format("%Y-%m-%d").to_string());
            record.push(row.entity.clone());
            record.extend(row.values.iter().map(|v| v.to_string()));
            record.push(row.periodicity.clone());
            record.push(row.ingested_at.map(|t| t.to_rfc3339()).unwrap_or_default());
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write into `dir` under the conventional file name.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(Self::file_name(&self.family));
        self.write_csv(&path)?;
        Ok(path)
    }

    /// Read a consolidated CSV back. The family comes from the file name
    /// and must be configured.
    pub fn read_csv(path: &Path, registry: &FamilyRegistry) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let family = file_pattern()
            .captures(&name)
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| {
                Error::mapping(&name, "file name is not consolidated_data_<family>.csv")
            })?;
        registry.get(&family)?;

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)?;
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();

        let find = |column: &str| headers.iter().position(|h| h == column);
        let malformed = |reason: String| Error::source_format(path, "csv", reason);
        let period_idx = find(PERIOD_COLUMN)
            .ok_or_else(|| malformed(format!("missing '{}' column", PERIOD_COLUMN)))?;
        let entity_idx = find(ENTITY_FIELD)
            .ok_or_else(|| malformed(format!("missing '{}' column", ENTITY_FIELD)))?;
        let periodicity_idx = find(PERIODICITY_COLUMN);
        let ingested_idx = find(INGESTED_AT_COLUMN);

        let value_idx: Vec<usize> = (0..headers.len())
            .filter(|i| {
                ![Some(period_idx), Some(entity_idx), periodicity_idx, ingested_idx]
                    .contains(&Some(*i))
            })
            .collect();
        let fields = value_idx.iter().map(|&i| headers[i].clone()).collect();

        let mut rows = Vec::new();
        for (line_idx, record) in reader.records().enumerate() {
            let record = record?;
            let line = line_idx + 2;
            let cell = |i: usize| record.get(i).unwrap_or("");

            let period = NaiveDate::parse_from_str(cell(period_idx), "%Y-%m-%d")
                .map_err(|e| malformed(format!("line {}: bad date: {}", line, e)))?;
            let ingested_at = match ingested_idx.map(cell) {
                Some(s) if !s.is_empty() => Some(
                    DateTime::parse_from_rfc3339(s)
                        .map_err(|e| malformed(format!("line {}: bad timestamp: {}", line, e)))?
                        .with_timezone(&Utc),
                ),
                _ => None,
            };
            let periodicity = periodicity_idx
                .map(cell)
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_PERIODICITY)
                .to_string();
            let values = value_idx
                .iter()
                .map(|&i| coerce_number(&RawValue::Text(cell(i).to_string())).unwrap_or(0.0))
                .collect();

            rows.push(TaggedRow {
                period,
                entity: cell(entity_idx).to_string(),
                values,
                periodicity,
                ingested_at,
            });
        }

        Ok(Self {
            family,
            fields,
            rows,
        })
    }
}
