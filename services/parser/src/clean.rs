//! Row Cleaner: keeps entity rows, coerces every value field to a number.
//!
//! Filtering is two passes. The system aggregate row ("Sistema */") is set
//! aside first, then the denylist runs over what is left, then the aggregate
//! is put back under [`AGGREGATE_LABEL`].
//!
//! Values that cannot be read as numbers ("n.a.", "-", blanks) become `0.0`.
//! Downstream, "no data" and a reported zero are indistinguishable.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::extract::{RawRow, RawTable, RawValue};

/// Entity label given to the preserved system aggregate row.
pub const AGGREGATE_LABEL: &str = "Sistema";

/// Structural labels that never name an entity (case-insensitive substrings).
pub const DENYLIST: &[&str] = &[
    "CONCEPTO",
    "NOTAS",
    "TOTAL",
    "FUENTE",
    "Elaborado por",
    "CNBV",
    "Sistema",
];

fn heading_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^(instituci[oó]n(es)?|entidad(es)?|bancos?)\s*:?$").expect("static regex")
    })
}

fn aggregate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)^sistema\s*\*+\s*/?$").expect("static regex"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanRow {
    /// 1-based sheet row, kept for diagnostics.
    pub row: u32,
    pub entity: String,
    /// One value per field after the entity, in column order.
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanTable {
    pub family: String,
    /// Field names after the entity field.
    pub fields: Vec<String>,
    pub rows: Vec<CleanRow>,
}

impl CleanTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleaningStats {
    pub dropped_empty: usize,
    pub dropped_denylisted: usize,
    pub aggregates: usize,
    pub coerced_to_zero: usize,
}

/// True when the entity text is the system aggregate marker.
pub fn is_aggregate(entity: &str) -> bool {
    aggregate_pattern().is_match(entity.trim())
}

/// True when the entity text is a column heading ("Institución"), matched whole.
pub fn is_heading(entity: &str) -> bool {
    heading_pattern().is_match(entity.trim())
}

/// True when the entity text contains a denylisted structural term or is a
/// repeated column heading.
pub fn is_denylisted(entity: &str) -> bool {
    let lower = entity.to_lowercase();
    DENYLIST
        .iter()
        .any(|term| lower.contains(&term.to_lowercase()))
        || is_heading(entity)
}

/// Read a raw value as a finite number.
pub fn coerce_number(value: &RawValue) -> Option<f64> {
    let n = match value {
        RawValue::Number(n) => *n,
        RawValue::Text(s) => {
            let compact: String = s
                .chars()
                .filter(|c| *c != ',' && !c.is_whitespace())
                .collect();
            compact.parse::<f64>().ok()?
        }
        RawValue::Empty => return None,
    };
    n.is_finite().then_some(n)
}

fn entity_text(value: &RawValue) -> Option<String> {
    let text = match value {
        RawValue::Text(s) => s.trim().to_string(),
        RawValue::Number(n) => n.to_string(),
        RawValue::Empty => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Clean a raw table. The entity is the first column.
///
/// Never fails: a table where every row is discarded comes back empty.
pub fn clean_table(raw: &RawTable) -> (CleanTable, CleaningStats) {
    let mut stats = CleaningStats::default();

    // Pass 1: drop empty entities, set the aggregate row aside.
    let mut aggregates: Vec<(usize, &RawRow, String)> = Vec::new();
    let mut candidates: Vec<(usize, &RawRow, String)> = Vec::new();
    for (pos, row) in raw.rows.iter().enumerate() {
        let Some(entity) = row.values.first().and_then(entity_text) else {
            stats.dropped_empty += 1;
            continue;
        };
        if is_aggregate(&entity) {
            aggregates.push((pos, row, AGGREGATE_LABEL.to_string()));
        } else {
            candidates.push((pos, row, entity));
        }
    }

    // Pass 2: denylist over the remaining rows only.
    let before = candidates.len();
    candidates.retain(|(_, _, entity)| !is_denylisted(entity));
    stats.dropped_denylisted = before - candidates.len();
    stats.aggregates = aggregates.len();

    // Restore the aggregate at its original sheet position.
    candidates.extend(aggregates);
    candidates.sort_by_key(|(pos, _, _)| *pos);

    let width = raw.columns.len().saturating_sub(1);
    let rows = candidates
        .into_iter()
        .map(|(_, row, entity)| {
            let values = (1..=width)
                .map(|i| {
                    let value = row.values.get(i).unwrap_or(&RawValue::Empty);
                    coerce_number(value).unwrap_or_else(|| {
                        stats.coerced_to_zero += 1;
                        0.0
                    })
                })
                .collect();
            CleanRow {
                row: row.row,
                entity: entity.trim().to_string(),
                values,
            }
        })
        .collect();

    debug!(
        family = %raw.family,
        dropped_empty = stats.dropped_empty,
        dropped_denylisted = stats.dropped_denylisted,
        aggregates = stats.aggregates,
        coerced_to_zero = stats.coerced_to_zero,
        "cleaned"
    );

    (
        CleanTable {
            family: raw.family.clone(),
            fields: raw.columns.iter().skip(1).cloned().collect(),
            rows,
        },
        stats,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> RawValue {
        RawValue::Text(s.to_string())
    }

    fn raw(rows: Vec<Vec<RawValue>>) -> RawTable {
        RawTable {
            family: "vivienda".to_string(),
            sheet: "CCV".to_string(),
            columns: vec!["Entidad".to_string(), "CarteraTotal".to_string(), "IMOR".to_string()],
            rows: rows
                .into_iter()
                .enumerate()
                .map(|(i, values)| RawRow {
                    row: i as u32 + 6,
                    values,
                })
                .collect(),
        }
    }

    // -------------------------------------------------------------------------
    // DENYLIST AND AGGREGATE
    // -------------------------------------------------------------------------

    #[test]
    fn test_total_sistema_is_discarded() {
        let (table, stats) = clean_table(&raw(vec![vec![text("TOTAL SISTEMA"), RawValue::Number(1.0)]]));
        assert!(table.is_empty());
        assert_eq!(stats.dropped_denylisted, 1);
    }

    #[test]
    fn test_sistema_footnote_is_preserved_and_renamed() {
        let (table, stats) = clean_table(&raw(vec![vec![text("Sistema */"), RawValue::Number(5.0)]]));
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].entity, AGGREGATE_LABEL);
        assert_eq!(table.rows[0].values, vec![5.0, 0.0]);
        assert_eq!(stats.aggregates, 1);
    }

    #[test]
    fn test_aggregate_pattern_variants() {
        assert!(is_aggregate("Sistema */"));
        assert!(is_aggregate("  SISTEMA*/ "));
        assert!(is_aggregate("Sistema **"));
        assert!(!is_aggregate("Sistema"));
        assert!(!is_aggregate("Total Sistema */"));
        assert!(!is_aggregate("Sistema financiero */"));
    }

    #[test]
    fn test_structural_rows_are_discarded() {
        let rows = vec![
            vec![text("Concepto"), text("Cartera")],
            vec![text("Notas: cifras en millones")],
            vec![text("Fuente: CNBV")],
            vec![text("Elaborado por la Vicepresidencia")],
            vec![text("Otros sistemas de pago")],
            vec![text("Banorte"), RawValue::Number(3.0)],
        ];
        let (table, stats) = clean_table(&raw(rows));
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].entity, "Banorte");
        assert_eq!(stats.dropped_denylisted, 5);
    }

    #[test]
    fn test_aggregate_keeps_sheet_position() {
        let rows = vec![
            vec![text("BBVA México"), RawValue::Number(1.0)],
            vec![text("Sistema */"), RawValue::Number(9.0)],
            vec![text("Total"), RawValue::Number(9.0)],
            vec![text("Banorte"), RawValue::Number(2.0)],
        ];
        let (table, _) = clean_table(&raw(rows));
        let entities: Vec<&str> = table.rows.iter().map(|r| r.entity.as_str()).collect();
        assert_eq!(entities, vec!["BBVA México", "Sistema", "Banorte"]);
    }

    #[test]
    fn test_repeated_heading_row_is_discarded() {
        let rows = vec![
            vec![text("BBVA México"), RawValue::Number(1.0)],
            vec![text("Institución"), text("Cartera total"), text("IMOR")],
            vec![text(" INSTITUCIONES ")],
            vec![text("Entidad")],
            vec![text("Banorte"), RawValue::Number(2.0)],
        ];
        let (table, stats) = clean_table(&raw(rows));
        let entities: Vec<&str> = table.rows.iter().map(|r| r.entity.as_str()).collect();
        assert_eq!(entities, vec!["BBVA México", "Banorte"]);
        assert_eq!(stats.dropped_denylisted, 3);
    }

    #[test]
    fn test_heading_match_is_whole_label() {
        assert!(is_heading("Institución"));
        assert!(is_heading("institucion:"));
        assert!(is_heading("Entidades"));
        assert!(is_heading("Banco"));
        assert!(!is_heading("Banco Azteca"));
        assert!(!is_heading("Entidad de Fomento"));
        assert!(!is_heading("Institución de Banca Múltiple X"));
    }

    // -------------------------------------------------------------------------
    // ENTITY NORMALIZATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_empty_entities_are_dropped() {
        let rows = vec![
            vec![RawValue::Empty, RawValue::Number(1.0)],
            vec![text("   "), RawValue::Number(1.0)],
            vec![text("  HSBC  "), RawValue::Number(1.0)],
        ];
        let (table, stats) = clean_table(&raw(rows));
        assert_eq!(stats.dropped_empty, 2);
        assert_eq!(table.rows[0].entity, "HSBC");
    }

    #[test]
    fn test_all_rows_discarded_yields_empty_table() {
        let rows = vec![vec![text("Concepto")], vec![text("TOTAL")], vec![RawValue::Empty]];
        let (table, _) = clean_table(&raw(rows));
        assert!(table.is_empty());
        assert_eq!(table.fields, vec!["CarteraTotal", "IMOR"]);
    }

    // -------------------------------------------------------------------------
    // NUMERIC COERCION
    // -------------------------------------------------------------------------

    #[test]
    fn test_placeholders_become_zero() {
        let rows = vec![vec![text("Inbursa"), text("n.a."), text("-")]];
        let (table, stats) = clean_table(&raw(rows));
        assert_eq!(table.rows[0].values, vec![0.0, 0.0]);
        assert_eq!(stats.coerced_to_zero, 2);
    }

    #[test]
    fn test_locale_formatted_numbers() {
        assert_eq!(coerce_number(&text("1,234,567.89")), Some(1_234_567.89));
        assert_eq!(coerce_number(&text(" 12.5 ")), Some(12.5));
        assert_eq!(coerce_number(&text("-3.2")), Some(-3.2));
        assert_eq!(coerce_number(&text("n.d.")), None);
        assert_eq!(coerce_number(&text("s.i.")), None);
        assert_eq!(coerce_number(&RawValue::Empty), None);
        assert_eq!(coerce_number(&RawValue::Number(f64::NAN)), None);
        assert_eq!(coerce_number(&text("inf")), None);
    }

    #[test]
    fn test_short_rows_are_padded_with_zero() {
        let (table, _) = clean_table(&raw(vec![vec![text("Banregio")]]));
        assert_eq!(table.rows[0].values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_numeric_entity_kept_as_text() {
        let (table, _) = clean_table(&raw(vec![vec![RawValue::Number(40012.0), RawValue::Number(1.0)]]));
        assert_eq!(table.rows[0].entity, "40012");
    }
}
