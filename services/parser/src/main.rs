//! Parser Service - Turns monthly bulletin workbooks into consolidated tables
//!
//! Responsibilities:
//! - Discover the downloaded workbooks
//! - Run every configured family over every workbook
//! - Write one consolidated CSV per family plus `run_report.json`
//! - Optionally write the mapped facts as CSV
//!
//! Usage:
//!   cargo run --bin parser -- --input-dir ./descargas_cnbv --out-dir ./archivos_procesados
//!   cargo run --bin parser -- boletin_2024_01.xlsx boletin_2024_02.xlsx --facts-out facts.csv

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parser::facts::write_facts_csv;
use parser::period::TagContext;
use parser::{FamilyRegistry, Pipeline, RunReport};

const WORKBOOK_EXTENSIONS: &[&str] = &["xlsx", "xls"];

#[derive(Parser, Debug)]
#[command(name = "parser", about = "Extracts banking bulletin tables into consolidated CSVs")]
struct Args {
    /// Workbooks to process; when empty, every workbook in --input-dir
    files: Vec<PathBuf>,

    /// Directory scanned for workbooks (overrides INPUT_DIR)
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Directory for consolidated CSVs and the run report (overrides OUTPUT_DIR)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Family configuration JSON; the built-in families when omitted
    #[arg(long)]
    families: Option<PathBuf>,

    /// Force this 1-based header row for every family
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    header_row: Option<u32>,

    /// Also write the mapped facts of every family to this CSV
    #[arg(long)]
    facts_out: Option<PathBuf>,

    /// Periodicity label stamped on every row
    #[arg(long, default_value = parser::period::DEFAULT_PERIODICITY)]
    periodicity: String,
}

#[derive(Debug, Clone)]
struct Config {
    input_dir: PathBuf,
    out_dir: PathBuf,
    families_path: Option<PathBuf>,
}

impl Config {
    fn from_env() -> Self {
        Self {
            input_dir: PathBuf::from(
                std::env::var("INPUT_DIR").unwrap_or_else(|_| "./descargas_cnbv".to_string()),
            ),
            out_dir: PathBuf::from(
                std::env::var("OUTPUT_DIR").unwrap_or_else(|_| "./archivos_procesados".to_string()),
            ),
            families_path: std::env::var("FAMILIES_CONFIG").ok().map(PathBuf::from),
        }
    }

    fn apply(mut self, args: &Args) -> Self {
        if let Some(dir) = &args.input_dir {
            self.input_dir = dir.clone();
        }
        if let Some(dir) = &args.out_dir {
            self.out_dir = dir.clone();
        }
        if let Some(path) = &args.families {
            self.families_path = Some(path.clone());
        }
        self
    }
}

fn is_workbook(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    // Excel lock files ("~$boletin.xlsx") are not workbooks.
    if name.starts_with("~$") {
        return false;
    }
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            WORKBOOK_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Workbooks directly under `dir`, sorted by name.
fn discover_workbooks(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read input directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && is_workbook(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn load_registry(path: Option<&Path>) -> Result<FamilyRegistry> {
    match path {
        Some(path) => FamilyRegistry::load(path)
            .with_context(|| format!("Failed to load family configuration {}", path.display())),
        None => Ok(FamilyRegistry::builtin()),
    }
}

fn print_summary(report: &RunReport, written: &[PathBuf]) {
    println!("\n=== Parsing Summary ===");
    println!("Files: {}", report.files.len());
    println!("{:-<60}", "");
    for family in &report.families {
        println!(
            "  {:<22} files={:<3} rows={:<6} facts={}",
            family.family, family.files, family.rows, family.facts
        );
    }
    println!("{:-<60}", "");
    for path in written {
        println!("  wrote {}", path.display());
    }
    if !report.no_data.is_empty() {
        println!("No data: {}", report.no_data.join(", "));
    }
    if !report.skipped.is_empty() {
        println!("Skipped ({}):", report.skipped.len());
        for skip in &report.skipped {
            println!("  [{}] {} - {}", skip.family, skip.file.display(), skip.reason);
        }
    }
    if !report.duplicate_keys.is_empty() {
        println!(
            "Duplicate (period, entity) keys: {} (same bulletin supplied twice?)",
            report.duplicate_keys.len()
        );
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env().apply(&args);
    let registry = load_registry(config.families_path.as_deref())?;

    let inputs = if args.files.is_empty() {
        discover_workbooks(&config.input_dir)?
    } else {
        args.files.clone()
    };
    if inputs.is_empty() {
        anyhow::bail!("No workbooks found in {}", config.input_dir.display());
    }
    info!(files = inputs.len(), families = registry.len(), "starting run");

    let tag = TagContext {
        periodicity: args.periodicity.clone(),
        ..TagContext::now()
    };
    let mut report = RunReport::new(tag.ingested_at);
    let pipeline = Pipeline::new(&registry, tag).with_header_override(args.header_row);

    let mut books = pipeline.open_workbooks(&inputs, &mut report);
    let outputs = pipeline.run(&mut books, &mut report);

    std::fs::create_dir_all(&config.out_dir)
        .with_context(|| format!("Failed to create {}", config.out_dir.display()))?;

    let mut written = Vec::with_capacity(outputs.len());
    for output in &outputs {
        let path = output
            .table
            .write_to_dir(&config.out_dir)
            .with_context(|| format!("Failed to write table for {}", output.table.family))?;
        written.push(path);
    }

    if let Some(facts_path) = &args.facts_out {
        let facts: Vec<_> = outputs.iter().flat_map(|o| o.facts.iter().cloned()).collect();
        write_facts_csv(facts_path, &facts)
            .with_context(|| format!("Failed to write facts to {}", facts_path.display()))?;
        info!(facts = facts.len(), file = %facts_path.display(), "facts written");
    }

    let report_path = config.out_dir.join("run_report.json");
    report
        .write_json(&report_path)
        .context("Failed to write run report")?;

    print_summary(&report, &written);
    if outputs.is_empty() {
        warn!("no family produced data");
    }
    println!("Report: {}", report_path.display());

    Ok(())
}
