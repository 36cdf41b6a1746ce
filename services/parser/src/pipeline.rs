//! Runs every family over every input file.
//!
//! Single-threaded by construction: each family is extracted, cleaned and
//! tagged file by file, then consolidated and mapped before the next family
//! starts. A failing (file, family) pair is recorded in the [`RunReport`] and
//! skipped; it never aborts the batch.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::clean::clean_table;
use crate::config::{FamilyConfig, FamilyRegistry};
use crate::consolidate::{consolidate, ConsolidatedTable};
use crate::error::{Error, Result};
use crate::extract::{extract_family, SheetSource, Workbook};
use crate::facts::{dedup_facts, map_table, FactRow};
use crate::period::{period_from_path, tag_table, TagContext};

/// One skipped (file, family) contribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Skip {
    pub family: String,
    pub file: PathBuf,
    pub kind: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FamilySummary {
    pub family: String,
    pub files: usize,
    pub rows: usize,
    pub facts: usize,
    pub duplicate_facts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateKey {
    pub family: String,
    pub period: NaiveDate,
    pub entity: String,
}

/// Everything a run skipped or produced, attributable per file and family.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub files: Vec<PathBuf>,
    pub families: Vec<FamilySummary>,
    pub no_data: Vec<String>,
    pub skipped: Vec<Skip>,
    pub duplicate_keys: Vec<DuplicateKey>,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            files: Vec::new(),
            families: Vec::new(),
            no_data: Vec::new(),
            skipped: Vec::new(),
            duplicate_keys: Vec::new(),
        }
    }

    pub fn skip(&mut self, family: &str, file: &Path, error: &Error) {
        warn!(family, file = %file.display(), kind = error.kind(), "skipped: {}", error);
        self.skipped.push(Skip {
            family: family.to_string(),
            file: file.to_path_buf(),
            kind: error.kind().to_string(),
            reason: error.to_string(),
        });
    }

    fn skip_empty(&mut self, family: &str, file: &Path) {
        warn!(family, file = %file.display(), "skipped: no entity rows after cleaning");
        self.skipped.push(Skip {
            family: family.to_string(),
            file: file.to_path_buf(),
            kind: "empty".to_string(),
            reason: "no entity rows after cleaning".to_string(),
        });
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Consolidated table of one family and the facts it maps to.
#[derive(Debug, Clone)]
pub struct FamilyOutput {
    pub table: ConsolidatedTable,
    pub facts: Vec<FactRow>,
}

pub struct Pipeline<'a> {
    registry: &'a FamilyRegistry,
    tag: TagContext,
    header_override: Option<u32>,
}

impl<'a> Pipeline<'a> {
    pub fn new(registry: &'a FamilyRegistry, tag: TagContext) -> Self {
        Self {
            registry,
            tag,
            header_override: None,
        }
    }

    /// Force one header row for every family instead of probing.
    pub fn with_header_override(mut self, row: Option<u32>) -> Self {
        self.header_override = row;
        self
    }

    /// Open every path; unreadable files are skipped for all families.
    pub fn open_workbooks(&self, paths: &[PathBuf], report: &mut RunReport) -> Vec<Workbook> {
        let mut books = Vec::with_capacity(paths.len());
        for path in paths {
            report.files.push(path.clone());
            match Workbook::open(path) {
                Ok(book) => books.push(book),
                Err(e) => {
                    for family in self.registry.iter() {
                        report.skip(&family.name, path, &e);
                    }
                }
            }
        }
        books
    }

    /// Run every configured family, in configuration order.
    pub fn run<S: SheetSource>(&self, sources: &mut [S], report: &mut RunReport) -> Vec<FamilyOutput> {
        let mut outputs = Vec::new();
        for family in self.registry.iter() {
            if let Some(output) = self.run_family(family, sources, report) {
                outputs.push(output);
            }
        }
        outputs
    }

    pub fn run_family<S: SheetSource>(
        &self,
        family: &FamilyConfig,
        sources: &mut [S],
        report: &mut RunReport,
    ) -> Option<FamilyOutput> {
        let mut tagged = Vec::new();
        for source in sources.iter_mut() {
            let file = source.path().to_path_buf();
            // A file without a period is excluded even when its sheet is empty.
            let step = period_from_path(&file)
                .and_then(|_| extract_family(source, family, self.header_override))
                .map(|raw| clean_table(&raw).0)
                .and_then(|clean| {
                    if clean.is_empty() {
                        Ok(None)
                    } else {
                        tag_table(clean, &file, &self.tag).map(Some)
                    }
                });
            match step {
                Ok(Some(table)) => tagged.push(table),
                Ok(None) => report.skip_empty(&family.name, &file),
                Err(e) => report.skip(&family.name, &file, &e),
            }
        }
        let files = tagged.len();

        let table = match consolidate(family, tagged) {
            Ok(Some(table)) => table,
            Ok(None) => {
                warn!(family = %family.name, "no data for family");
                report.no_data.push(family.name.clone());
                return None;
            }
            Err(e) => {
                report.skip(&family.name, &output_name(family), &e);
                report.no_data.push(family.name.clone());
                return None;
            }
        };

        for (period, entity) in table.duplicate_keys() {
            warn!(family = %family.name, %period, entity = %entity, "duplicate (period, entity); same source supplied twice?");
            report.duplicate_keys.push(DuplicateKey {
                family: family.name.clone(),
                period,
                entity,
            });
        }

        let (facts, duplicate_facts) = match map_table(&table, family) {
            Ok(facts) => dedup_facts(facts),
            Err(e) => {
                report.skip(&family.name, &output_name(family), &e);
                (Vec::new(), 0)
            }
        };

        info!(
            family = %family.name,
            files,
            rows = table.rows.len(),
            facts = facts.len(),
            "family done"
        );
        report.families.push(FamilySummary {
            family: family.name.clone(),
            files,
            rows: table.rows.len(),
            facts: facts.len(),
            duplicate_facts,
        });
        Some(FamilyOutput { table, facts })
    }
}

/// Family-level failures are attributed to the family's output file.
fn output_name(family: &FamilyConfig) -> PathBuf {
    PathBuf::from(ConsolidatedTable::file_name(&family.name))
}
