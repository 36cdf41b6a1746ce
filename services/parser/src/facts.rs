//! Fact Mapper: expands consolidated rows into `(period, indicator, entity,
//! value)` facts according to the family's fan-out policy.

use std::collections::HashSet;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{FamilyConfig, FamilyRegistry, FanOut};
use crate::consolidate::ConsolidatedTable;
use crate::error::{Error, Result};
use crate::period::TaggedRow;

/// The atomic row persisted to the fact table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRow {
    #[serde(rename = "fecha")]
    pub period: NaiveDate,
    #[serde(rename = "id_indicador")]
    pub indicator_id: i32,
    #[serde(rename = "grupo_banco")]
    pub entity: String,
    #[serde(rename = "valor")]
    pub value: f64,
    #[serde(rename = "tipo_credito")]
    pub credit_type: Option<String>,
    #[serde(rename = "tipo_captacion")]
    pub deposit_type: Option<String>,
}

/// Uniqueness key of a fact; the value is not part of it.
pub type FactKey = (NaiveDate, String, i32, Option<String>, Option<String>);

impl FactRow {
    pub fn key(&self) -> FactKey {
        (
            self.period,
            self.entity.clone(),
            self.indicator_id,
            self.credit_type.clone(),
            self.deposit_type.clone(),
        )
    }
}

/// Expand one consolidated table into fact rows.
pub fn map_table(table: &ConsolidatedTable, family: &FamilyConfig) -> Result<Vec<FactRow>> {
    if table.family != family.name {
        return Err(Error::mapping(
            &family.name,
            format!("table belongs to family '{}'", table.family),
        ));
    }
    let require = |field: &str| {
        table
            .field_index(field)
            .ok_or_else(|| Error::mapping(&family.name, format!("column '{}' is missing", field)))
    };

    let mut facts = Vec::new();
    match &family.fan_out {
        FanOut::SingleValue {
            indicator_id,
            value_field,
            credit_type,
        } => {
            let idx = require(value_field.as_str())?;
            for row in &table.rows {
                facts.push(FactRow {
                    period: row.period,
                    indicator_id: *indicator_id,
                    entity: row.entity.clone(),
                    value: value_at(row, idx),
                    credit_type: credit_type.clone(),
                    deposit_type: None,
                });
            }
        }
        FanOut::MultiIndicator { indicators } => {
            // Fields the table does not carry produce no facts.
            let present: Vec<(usize, i32)> = indicators
                .iter()
                .filter_map(|ind| table.field_index(&ind.field).map(|idx| (idx, ind.indicator_id)))
                .collect();
            for row in &table.rows {
                for &(idx, indicator_id) in &present {
                    facts.push(FactRow {
                        period: row.period,
                        indicator_id,
                        entity: row.entity.clone(),
                        value: value_at(row, idx),
                        credit_type: None,
                        deposit_type: None,
                    });
                }
            }
        }
        FanOut::MultiQualifier {
            indicator_id,
            qualifiers,
        } => {
            let resolved = qualifiers
                .iter()
                .map(|q| {
                    let indices = q
                        .fields
                        .iter()
                        .map(|field| require(field.as_str()))
                        .collect::<Result<Vec<_>>>()?;
                    Ok((indices, q.qualifier.as_str()))
                })
                .collect::<Result<Vec<_>>>()?;
            for row in &table.rows {
                for (indices, qualifier) in &resolved {
                    facts.push(FactRow {
                        period: row.period,
                        indicator_id: *indicator_id,
                        entity: row.entity.clone(),
                        value: indices.iter().map(|&idx| value_at(row, idx)).sum(),
                        credit_type: None,
                        deposit_type: Some(qualifier.to_string()),
                    });
                }
            }
        }
    }

    debug!(family = %family.name, rows = table.rows.len(), facts = facts.len(), "mapped");
    Ok(facts)
}

/// Rows read back from CSV may be ragged; missing cells count as zero.
fn value_at(row: &TaggedRow, idx: usize) -> f64 {
    row.values.get(idx).copied().unwrap_or(0.0)
}

/// Map a table using the family named in the table itself.
pub fn map_with_registry(table: &ConsolidatedTable, registry: &FamilyRegistry) -> Result<Vec<FactRow>> {
    map_table(table, registry.get(&table.family)?)
}

/// Drop facts whose key was already seen, keeping the first occurrence.
///
/// Only guards a single run; cross-run duplicates are the storage layer's job.
pub fn dedup_facts(facts: Vec<FactRow>) -> (Vec<FactRow>, usize) {
    let mut seen: HashSet<FactKey> = HashSet::with_capacity(facts.len());
    let before = facts.len();
    let kept: Vec<FactRow> = facts.into_iter().filter(|f| seen.insert(f.key())).collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

pub fn write_facts_csv(path: &Path, facts: &[FactRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for fact in facts {
        writer.serialize(fact)?;
    }
    writer.flush()?;
    Ok(())
}
