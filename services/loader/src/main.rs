//! Loader Service - Persists consolidated bulletin tables as indicator facts
//!
//! Responsibilities:
//! - Read `consolidated_data_<family>.csv` tables written by the parser
//! - Map every row to facts through the family's fan-out policy
//! - Insert facts into `indicador_hechos` in batches
//! - Track each invocation in `load_runs` for auditing
//!
//! Usage:
//!   cargo run --bin loader -- ./archivos_procesados
//!   cargo run --bin loader -- --dry-run --facts-out facts.csv ./archivos_procesados
//!   cargo run --bin loader -- --ensure-schema --mode reject consolidated_data_cartera.csv

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use parser::facts::write_facts_csv;
use parser::{dedup_facts, map_with_registry, ConsolidatedTable, FactRow, FamilyRegistry};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const TABLE_PREFIX: &str = "consolidated_data_";

/// Six binds per row keeps a batch far below the Postgres bind limit.
const DEFAULT_BATCH_SIZE: usize = 1000;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS indicador_hechos (
        id BIGSERIAL PRIMARY KEY,
        fecha DATE NOT NULL,
        id_indicador INTEGER NOT NULL,
        grupo_banco TEXT NOT NULL,
        valor DOUBLE PRECISION NOT NULL,
        tipo_credito TEXT,
        tipo_captacion TEXT
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS indicador_hechos_clave ON indicador_hechos (
        fecha, grupo_banco, id_indicador,
        (coalesce(tipo_credito, '')), (coalesce(tipo_captacion, ''))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS load_runs (
        load_run_id UUID PRIMARY KEY,
        started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        finished_at TIMESTAMPTZ,
        status TEXT NOT NULL,
        error TEXT,
        detail JSONB NOT NULL DEFAULT '{}'
    )
    "#,
];

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads consolidated bulletin tables into the fact table")]
struct Args {
    /// Consolidated CSV files or directories containing them (default: OUTPUT_DIR)
    paths: Vec<PathBuf>,

    /// Family configuration JSON; the built-in families when omitted
    #[arg(long)]
    families: Option<PathBuf>,

    /// What to do when a fact already exists
    #[arg(long, value_enum, default_value_t = InsertMode::Ignore)]
    mode: InsertMode,

    /// Rows per INSERT statement
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Create the fact and audit tables if missing
    #[arg(long, default_value = "false")]
    ensure_schema: bool,

    /// Dry run - map and report without connecting to the database
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Write the mapped facts to this CSV
    #[arg(long)]
    facts_out: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum InsertMode {
    /// Existing facts are left untouched and counted as skipped
    Ignore,
    /// Any existing fact fails the load
    Reject,
}

#[derive(Debug, Error)]
enum LoadError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error(transparent)]
    Pipeline(#[from] parser::Error),
}

#[derive(Debug, Clone)]
struct Config {
    db_url: Option<String>,
    input_dir: PathBuf,
    families_path: Option<PathBuf>,
}

impl Config {
    fn from_env() -> Self {
        Self {
            db_url: std::env::var("DB_URL").ok(),
            input_dir: PathBuf::from(
                std::env::var("OUTPUT_DIR").unwrap_or_else(|_| "./archivos_procesados".to_string()),
            ),
            families_path: std::env::var("FAMILIES_CONFIG").ok().map(PathBuf::from),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct InsertCounts {
    inserted: u64,
    skipped: u64,
}

/// Facts gathered from every readable table, plus the files that were not.
#[derive(Debug, Default)]
struct Collected {
    facts: Vec<FactRow>,
    tables: usize,
    duplicates: usize,
    failed: Vec<(PathBuf, String)>,
}

fn is_consolidated_table(path: &Path) -> bool {
    path.file_name()
        .map(|n| {
            let name = n.to_string_lossy();
            name.starts_with(TABLE_PREFIX) && name.ends_with(".csv")
        })
        .unwrap_or(false)
}

/// Expand directories into their consolidated tables; files pass through.
fn discover_tables(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut tables = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found = Vec::new();
            for entry in std::fs::read_dir(path)
                .with_context(|| format!("Failed to read directory {}", path.display()))?
            {
                let entry_path = entry?.path();
                if entry_path.is_file() && is_consolidated_table(&entry_path) {
                    found.push(entry_path);
                }
            }
            found.sort();
            tables.extend(found);
        } else {
            tables.push(path.clone());
        }
    }
    Ok(tables)
}

fn load_table(path: &Path, registry: &FamilyRegistry) -> Result<Vec<FactRow>, LoadError> {
    let table = ConsolidatedTable::read_csv(path, registry)?;
    Ok(map_with_registry(&table, registry)?)
}

/// Map every table; a table that cannot be read or mapped is skipped.
fn collect_facts(paths: &[PathBuf], registry: &FamilyRegistry) -> Collected {
    let mut collected = Collected::default();
    for path in paths {
        match load_table(path, registry) {
            Ok(facts) => {
                info!(file = %path.display(), facts = facts.len(), "table mapped");
                collected.tables += 1;
                collected.facts.extend(facts);
            }
            Err(e) => {
                warn!(file = %path.display(), "skipped: {}", e);
                collected.failed.push((path.clone(), e.to_string()));
            }
        }
    }
    let (facts, duplicates) = dedup_facts(std::mem::take(&mut collected.facts));
    if duplicates > 0 {
        warn!(duplicates, "duplicate facts dropped before insert");
    }
    collected.facts = facts;
    collected.duplicates = duplicates;
    collected
}

async fn ensure_schema(pool: &PgPool) -> Result<(), LoadError> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn insert_statement(batch: &[FactRow], mode: InsertMode) -> QueryBuilder<'static, Postgres> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO indicador_hechos (fecha, id_indicador, grupo_banco, valor, tipo_credito, tipo_captacion) ",
    );
    builder.push_values(batch, |mut row, fact| {
        row.push_bind(fact.period)
            .push_bind(fact.indicator_id)
            .push_bind(fact.entity.clone())
            .push_bind(fact.value)
            .push_bind(fact.credit_type.clone())
            .push_bind(fact.deposit_type.clone());
    });
    if mode == InsertMode::Ignore {
        builder.push(" ON CONFLICT DO NOTHING");
    }
    builder
}

/// Insert all facts in one transaction, `batch_size` rows per statement.
async fn insert_facts(
    pool: &PgPool,
    facts: &[FactRow],
    mode: InsertMode,
    batch_size: usize,
) -> Result<InsertCounts, LoadError> {
    let mut counts = InsertCounts::default();
    let mut tx = pool.begin().await?;
    for batch in facts.chunks(batch_size.max(1)) {
        let result = insert_statement(batch, mode).build().execute(&mut *tx).await?;
        counts.inserted += result.rows_affected();
        counts.skipped += batch.len() as u64 - result.rows_affected();
    }
    tx.commit().await?;
    Ok(counts)
}

async fn create_load_run(pool: &PgPool, tables: usize, facts: usize) -> Result<Uuid, LoadError> {
    let load_run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO load_runs (load_run_id, status, detail)
        VALUES ($1, 'running', $2)
        "#,
    )
    .bind(load_run_id)
    .bind(serde_json::json!({ "tables": tables, "facts": facts }))
    .execute(pool)
    .await?;
    Ok(load_run_id)
}

async fn finish_load_run(
    pool: &PgPool,
    load_run_id: Uuid,
    status: &str,
    error: Option<&str>,
    counts: InsertCounts,
) -> Result<(), LoadError> {
    sqlx::query(
        r#"
        UPDATE load_runs
        SET finished_at = now(), status = $2, error = $3, detail = detail || $4
        WHERE load_run_id = $1
        "#,
    )
    .bind(load_run_id)
    .bind(status)
    .bind(error)
    .bind(serde_json::json!({ "inserted": counts.inserted, "skipped": counts.skipped }))
    .execute(pool)
    .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    let registry = match args.families.as_ref().or(config.families_path.as_ref()) {
        Some(path) => FamilyRegistry::load(path)
            .with_context(|| format!("Failed to load family configuration {}", path.display()))?,
        None => FamilyRegistry::builtin(),
    };

    let inputs = if args.paths.is_empty() {
        vec![config.input_dir.clone()]
    } else {
        args.paths.clone()
    };
    let tables = discover_tables(&inputs)?;
    if tables.is_empty() {
        anyhow::bail!("No consolidated tables found in {:?}", inputs);
    }

    println!("=== Banking Bulletin Loader ===");
    println!("Tables: {}", tables.len());
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let collected = collect_facts(&tables, &registry);
    for (path, reason) in &collected.failed {
        println!("  ✗ {} - {}", path.display(), reason);
    }
    println!(
        "Mapped {} facts from {} table(s) ({} duplicates dropped)",
        collected.facts.len(),
        collected.tables,
        collected.duplicates
    );

    if let Some(facts_path) = &args.facts_out {
        write_facts_csv(facts_path, &collected.facts)
            .with_context(|| format!("Failed to write facts to {}", facts_path.display()))?;
        println!("Facts written to {}", facts_path.display());
    }

    if args.dry_run {
        println!("\nDry run - no facts saved to database");
        return Ok(());
    }

    let db_url = config.db_url.context("DB_URL env var missing")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    if args.ensure_schema {
        ensure_schema(&pool).await.context("Failed to create schema")?;
        info!("schema ensured");
    }

    let load_run_id = create_load_run(&pool, collected.tables, collected.facts.len()).await?;
    let result = insert_facts(&pool, &collected.facts, args.mode, args.batch_size).await;

    match &result {
        Ok(counts) => {
            let status = if collected.failed.is_empty() { "ok" } else { "partial" };
            finish_load_run(&pool, load_run_id, status, None, *counts).await?;
        }
        Err(e) => {
            finish_load_run(&pool, load_run_id, "failed", Some(&e.to_string()), InsertCounts::default())
                .await?;
        }
    }

    let counts = result?;
    println!("\n=== Load Complete ===");
    println!("Load run: {}", load_run_id);
    println!("Inserted: {}", counts.inserted);
    println!("Skipped (already present): {}", counts.skipped);
    if !collected.failed.is_empty() {
        println!("Tables skipped: {}", collected.failed.len());
    }

    Ok(())
}
