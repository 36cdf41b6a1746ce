//! Indicator family configuration.
//!
//! A family describes one logical table read from every bulletin: where it
//! lives in the workbook, which columns to read and how its rows fan out
//! into facts. The set is static: built in, or loaded once from JSON.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Canonical name of the entity field; always the first configured column.
pub const ENTITY_FIELD: &str = "Entidad";

/// Header rows observed across bulletin revisions (1-based).
const DEFAULT_HEADER_ROWS: [u32; 2] = [5, 6];

/// Indicator identifiers in the fact table.
pub mod indicators {
    pub const ACTIVO_TOTAL: i32 = 24;
    pub const CAPITAL_CONTABLE: i32 = 25;
    pub const RESULTADO_NETO: i32 = 26;
    pub const CAPTACION: i32 = 27;
    pub const CARTERA: i32 = 28;
    pub const IMOR: i32 = 29;
}

/// One `(source column, canonical field)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Spreadsheet column letter, e.g. `"B"` or `"AE"`.
    pub column: String,
    pub field: String,
}

impl ColumnSpec {
    pub fn new(column: &str, field: &str) -> Self {
        Self {
            column: column.to_string(),
            field: field.to_string(),
        }
    }

    /// Zero-based column index.
    pub fn index(&self) -> Result<u32> {
        column_index(&self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorField {
    pub field: String,
    pub indicator_id: i32,
}

/// A deposit-type label and the fields summed into its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositQualifier {
    pub qualifier: String,
    pub fields: Vec<String>,
}

/// How a consolidated row expands into fact rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FanOut {
    /// One fact per row, read from `value_field`.
    SingleValue {
        indicator_id: i32,
        value_field: String,
        #[serde(default)]
        credit_type: Option<String>,
    },
    /// One fact per row and mapped field; each field has its own indicator.
    MultiIndicator { indicators: Vec<IndicatorField> },
    /// One fact per row and deposit-type qualifier under a shared indicator.
    MultiQualifier {
        indicator_id: i32,
        qualifiers: Vec<DepositQualifier>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyConfig {
    pub name: String,
    /// Candidate sheet names, first present wins.
    pub sheets: Vec<String>,
    /// Candidate header rows (1-based), tried in order.
    #[serde(default = "default_header_rows")]
    pub header_rows: Vec<u32>,
    pub columns: Vec<ColumnSpec>,
    pub fan_out: FanOut,
}

fn default_header_rows() -> Vec<u32> {
    DEFAULT_HEADER_ROWS.to_vec()
}

impl FamilyConfig {
    /// Canonical field names in column order, entity first.
    pub fn field_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.field.as_str()).collect()
    }

    /// Field names after the entity field.
    pub fn value_fields(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().skip(1).map(|c| c.field.as_str())
    }

    fn validate(&self) -> Result<()> {
        let fail = |reason: String| Error::Config(format!("family '{}': {}", self.name, reason));

        if self.name.trim().is_empty() {
            return Err(Error::Config("family with empty name".to_string()));
        }
        if self.sheets.is_empty() {
            return Err(fail("no sheet names".to_string()));
        }
        if self.header_rows.is_empty() || self.header_rows.contains(&0) {
            return Err(fail("header rows must be 1-based and non-empty".to_string()));
        }
        match self.columns.first() {
            Some(first) if first.field == ENTITY_FIELD => {}
            _ => return Err(fail(format!("first column must map to '{}'", ENTITY_FIELD))),
        }

        let mut seen = HashSet::new();
        for col in &self.columns {
            col.index().map_err(|e| fail(e.to_string()))?;
            if !seen.insert(col.field.as_str()) {
                return Err(fail(format!("duplicate field '{}'", col.field)));
            }
        }

        let require = |field: &str| {
            if seen.contains(field) && field != ENTITY_FIELD {
                Ok(())
            } else {
                Err(fail(format!("fan-out reads unknown field '{}'", field)))
            }
        };
        match &self.fan_out {
            FanOut::SingleValue { value_field, .. } => require(value_field.as_str())?,
            FanOut::MultiQualifier { qualifiers, .. } => {
                if qualifiers.is_empty() {
                    return Err(fail("no deposit qualifiers".to_string()));
                }
                for q in qualifiers {
                    if q.fields.is_empty() {
                        return Err(fail(format!("qualifier '{}' reads no field", q.qualifier)));
                    }
                    for field in &q.fields {
                        require(field.as_str())?;
                    }
                }
            }
            // Fields absent from a row are skipped at mapping time.
            FanOut::MultiIndicator { indicators } => {
                if indicators.is_empty() {
                    return Err(fail("no mapped indicators".to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Convert a spreadsheet column letter to a zero-based index.
pub fn column_index(letters: &str) -> Result<u32> {
    let letters = letters.trim();
    if letters.is_empty() || letters.len() > 3 {
        return Err(Error::Config(format!("invalid column letter '{}'", letters)));
    }
    let mut index: u32 = 0;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return Err(Error::Config(format!("invalid column letter '{}'", letters)));
        }
        index = index * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    // XFD is the last column Excel can address.
    if index > 16_384 {
        return Err(Error::Config(format!("column '{}' out of range", letters)));
    }
    Ok(index - 1)
}

#[derive(Debug, Deserialize, Serialize)]
struct RegistryFile {
    families: Vec<FamilyConfig>,
}

/// Ordered, validated set of families keyed by name.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyRegistry {
    families: Vec<FamilyConfig>,
}

impl FamilyRegistry {
    pub fn new(families: Vec<FamilyConfig>) -> Result<Self> {
        let mut names = HashSet::new();
        for family in &families {
            family.validate()?;
            if !names.insert(family.name.clone()) {
                return Err(Error::Config(format!("duplicate family '{}'", family.name)));
            }
        }
        Ok(Self { families })
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(content)?;
        Self::new(file.families)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn to_json(&self) -> Result<String> {
        let file = RegistryFile {
            families: self.families.clone(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn get(&self, name: &str) -> Result<&FamilyConfig> {
        self.families
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| Error::mapping(name, "not present in family configuration"))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FamilyConfig> {
        self.families.iter()
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// The families published in the monthly multiple-banking bulletin.
    pub fn builtin() -> Self {
        let mut families = vec![
            credit_family("vivienda", "CCV", "Vivienda"),
            credit_family("cartera", "CCT", "Total"),
            FamilyConfig {
                name: "captacion".to_string(),
                sheets: vec!["CaptRec".to_string()],
                header_rows: default_header_rows(),
                columns: columns(&[
                    ("B", ENTITY_FIELD),
                    ("E", "CaptacionTotal"),
                    ("H", "DepositoExigInmediata"),
                    ("K", "DepositoPlazoPG"),
                    ("N", "DepositoPlazoMV"),
                    ("Q", "TitulosCredito"),
                    ("T", "PrestamosInterBanc"),
                    ("W", "CuentaGlobalCapt"),
                ]),
                fan_out: FanOut::MultiQualifier {
                    indicator_id: indicators::CAPTACION,
                    // Term deposits are published split by holder; stored as one series.
                    qualifiers: [
                        ("CtaGlobalCapt", &["CuentaGlobalCapt"][..]),
                        ("DepExigInm", &["DepositoExigInmediata"][..]),
                        ("DepPlazo", &["DepositoPlazoPG", "DepositoPlazoMV"][..]),
                        ("Total", &["CaptacionTotal"][..]),
                    ]
                    .iter()
                    .map(|(qualifier, fields)| DepositQualifier {
                        qualifier: qualifier.to_string(),
                        fields: fields.iter().map(|f| f.to_string()).collect(),
                    })
                    .collect(),
                },
            },
            credit_family("tarjeta_credito", "CCCTC", "Tarjeta Crédito"),
            credit_family("nomina", "CCCN", "Nomina"),
            credit_family("personales", "CCCnrP", "Personales"),
            credit_family("empresariales", "CCE", "Empresariales"),
            FamilyConfig {
                name: "resultados".to_string(),
                sheets: vec!["Pm2".to_string()],
                header_rows: default_header_rows(),
                columns: columns(&[
                    ("B", ENTITY_FIELD),
                    ("G", "ActivoTotal"),
                    ("M", "Inversiones"),
                    ("S", "CarteraTotal"),
                    ("Y", "CaptacionTotal"),
                    ("AE", "CapitalContable"),
                    ("AK", "ResultadoNeto"),
                ]),
                fan_out: FanOut::MultiIndicator {
                    indicators: [
                        ("ActivoTotal", indicators::ACTIVO_TOTAL),
                        ("CapitalContable", indicators::CAPITAL_CONTABLE),
                        ("ResultadoNeto", indicators::RESULTADO_NETO),
                        ("CarteraTotal", indicators::CARTERA),
                        ("CaptacionTotal", indicators::CAPTACION),
                    ]
                    .iter()
                    .map(|(field, id)| IndicatorField {
                        field: field.to_string(),
                        indicator_id: *id,
                    })
                    .collect(),
                },
            },
            credit_family("auto", "CCCAut", "Auto"),
            credit_family("consumo", "CCCT", "Consumo"),
        ];

        for (name, sheet, credit_type) in [
            ("imor_vivienda", "CCV", "Vivienda"),
            ("imor_cartera", "CCT", "Total"),
            ("imor_tarjeta_credito", "CCCTC", "Tarjeta Credito"),
            ("imor_nomina", "CCCN", "Nomina"),
            ("imor_personales", "CCCnrP", "Personales"),
            ("imor_empresariales", "CCE", "Empresariales"),
            ("imor_auto", "CCCAut", "Auto"),
            ("imor_consumo", "CCCT", "Consumo"),
        ] {
            families.push(FamilyConfig {
                name: name.to_string(),
                sheets: vec![sheet.to_string()],
                header_rows: default_header_rows(),
                columns: columns(&[("B", ENTITY_FIELD), ("H", "IMORTotal")]),
                fan_out: FanOut::SingleValue {
                    indicator_id: indicators::IMOR,
                    value_field: "IMORTotal".to_string(),
                    credit_type: Some(credit_type.to_string()),
                },
            });
        }

        Self { families }
    }
}

fn columns(pairs: &[(&str, &str)]) -> Vec<ColumnSpec> {
    pairs
        .iter()
        .map(|(column, field)| ColumnSpec::new(column, field))
        .collect()
}

/// Credit portfolio sheets share one layout: balance, IMOR, ICOR, expected loss.
fn credit_family(name: &str, sheet: &str, credit_type: &str) -> FamilyConfig {
    FamilyConfig {
        name: name.to_string(),
        sheets: vec![sheet.to_string()],
        header_rows: default_header_rows(),
        columns: columns(&[
            ("B", ENTITY_FIELD),
            ("E", "CarteraTotal"),
            ("H", "IMOR"),
            ("K", "ICOR"),
            ("N", "PE"),
        ]),
        fan_out: FanOut::SingleValue {
            indicator_id: indicators::CARTERA,
            value_field: "CarteraTotal".to_string(),
            credit_type: Some(credit_type.to_string()),
        },
    }
}
