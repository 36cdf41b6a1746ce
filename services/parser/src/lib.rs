//! Banking bulletin pipeline: extracts the configured tables from each
//! monthly workbook, cleans and tags them with their reporting period,
//! consolidates them per indicator family and maps them to fact rows.
//!
//! Every stage takes its inputs explicitly (paths, family registry, tag
//! context); nothing here reads environment or global state.

pub mod clean;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod extract;
pub mod facts;
pub mod period;
pub mod pipeline;

pub use config::{FamilyConfig, FamilyRegistry, FanOut};
pub use consolidate::ConsolidatedTable;
pub use error::{Error, Result};
pub use facts::{dedup_facts, map_table, map_with_registry, FactRow};
pub use pipeline::{Pipeline, RunReport};
