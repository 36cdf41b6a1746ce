//! Collector Service - Downloads the monthly multiple-banking bulletin
//!
//! Responsibilities:
//! - Build the bulletin URL for each requested month
//! - Fetch with a timeout and retry transient failures with backoff
//! - Store the workbook under a name carrying its period
//! - Skip months already on disk unless forced
//!
//! Usage:
//!   # Single month:
//!   cargo run --bin collector -- --year 2025 --month 6
//!
//!   # Range of months (inclusive):
//!   cargo run --bin collector -- --year 2024 --month 1 --until 2025-06

use anyhow::{Context, Result};
use chrono::{Datelike, Months, NaiveDate};
use clap::Parser;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_BASE_URL: &str = "https://portafolioinfo.cnbv.gob.mx/_layouts/15/download.aspx?SourceUrl=https://portafolioinfo.cnbv.gob.mx/PortafolioInformacion/BE%20BM%20{year}{month}.xlsx";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Parser, Debug)]
#[command(name = "collector", about = "Downloads monthly banking bulletins")]
struct Args {
    /// Bulletin year
    #[arg(long)]
    year: i32,

    /// Bulletin month (1-12)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=12))]
    month: u32,

    /// Last month to download, inclusive (YYYY-MM)
    #[arg(long)]
    until: Option<String>,

    /// Directory for downloaded workbooks (overrides DOWNLOAD_DIR)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Attempts per month for transient failures (1-10)
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..=10))]
    retries: u32,

    /// Force re-download even if the file exists
    #[arg(long, default_value = "false")]
    force: bool,
}

#[derive(Debug, Clone)]
struct Config {
    base_url: String,
    download_dir: PathBuf,
    accept_invalid_certs: bool,
    rate_limit_ms: u64,
    backoff_ms: u64,
}

impl Config {
    fn from_env() -> Self {
        Self {
            base_url: std::env::var("BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            download_dir: PathBuf::from(
                std::env::var("DOWNLOAD_DIR").unwrap_or_else(|_| "./descargas_cnbv".to_string()),
            ),
            accept_invalid_certs: matches!(
                std::env::var("ACCEPT_INVALID_CERTS").as_deref(),
                Ok("1") | Ok("true")
            ),
            rate_limit_ms: std::env::var("RATE_LIMIT_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
            backoff_ms: std::env::var("RETRY_BACKOFF_MS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()
                .unwrap_or(2000),
        }
    }
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("bulletin not published: {url}")]
    NotFound { url: String },

    #[error("HTTP {status} for {url}")]
    Status { url: String, status: StatusCode },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl FetchError {
    fn is_transient(&self) -> bool {
        match self {
            FetchError::NotFound { .. } => false,
            FetchError::Status { status, .. } => is_transient_status(*status),
            FetchError::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Outcome of one month.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Collected {
    Downloaded(PathBuf),
    Present(PathBuf),
    NotPublished,
}

/// Fill `{year}` and `{month}` (zero-padded) in the URL template.
fn bulletin_url(template: &str, month: NaiveDate) -> String {
    let year = format!("{:04}", month.year());
    let mm = format!("{:02}", month.month());
    template
        .replace("{year:04d}", &year)
        .replace("{month:02d}", &mm)
        .replace("{year}", &year)
        .replace("{month}", &mm)
}

/// File name the parser reads the period back from.
fn bulletin_file_name(month: NaiveDate) -> String {
    format!(
        "cnbv_boletin_banca_multiple_{:04}_{:02}.xlsx",
        month.year(),
        month.month()
    )
}

fn parse_month(s: &str) -> Result<NaiveDate> {
    let (year, month) = s
        .trim()
        .split_once('-')
        .with_context(|| format!("Expected YYYY-MM, got '{}'", s))?;
    let year: i32 = year.parse().with_context(|| format!("Invalid year in '{}'", s))?;
    let month: u32 = month.parse().with_context(|| format!("Invalid month in '{}'", s))?;
    NaiveDate::from_ymd_opt(year, month, 1).with_context(|| format!("Invalid month '{}'", s))
}

/// First-of-month dates from `start` to `end`, inclusive.
fn month_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut months = Vec::new();
    let mut current = start;
    while current <= end {
        months.push(current);
        match current.checked_add_months(Months::new(1)) {
            Some(next) => current = next,
            None => break,
        }
    }
    months
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

async fn fetch_once(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, FetchError> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound {
            url: url.to_string(),
        });
    }
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status,
        });
    }
    Ok(resp.bytes().await?.to_vec())
}

/// Delay before retry `attempt + 1`: `base * 2^(attempt - 1)`, saturating.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

/// Fetch with exponential backoff on transient failures.
async fn fetch_with_retry(
    client: &reqwest::Client,
    url: &str,
    attempts: u32,
    backoff: Duration,
) -> Result<Vec<u8>, FetchError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match fetch_once(client, url).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = backoff_delay(backoff, attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, "transient failure: {}", e);
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Write via a temporary file so an interrupted download never looks complete.
async fn save_to_fs(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir).await?;
    let path = dir.join(file_name);
    let partial = dir.join(format!("{}.part", file_name));
    fs::write(&partial, bytes).await?;
    fs::rename(&partial, &path).await?;
    Ok(path)
}

async fn collect_month(
    client: &reqwest::Client,
    config: &Config,
    dir: &Path,
    month: NaiveDate,
    args: &Args,
) -> Result<Collected> {
    let file_name = bulletin_file_name(month);
    let target = dir.join(&file_name);
    if !args.force && fs::try_exists(&target).await.unwrap_or(false) {
        info!(file = %target.display(), "already downloaded");
        return Ok(Collected::Present(target));
    }

    let url = bulletin_url(&config.base_url, month);
    info!(%url, "fetching");
    let bytes = match fetch_with_retry(
        client,
        &url,
        args.retries,
        Duration::from_millis(config.backoff_ms),
    )
    .await
    {
        Ok(bytes) => bytes,
        Err(FetchError::NotFound { .. }) => return Ok(Collected::NotPublished),
        Err(e) => return Err(e.into()),
    };

    let path = save_to_fs(dir, &file_name, &bytes).await?;
    info!(
        file = %path.display(),
        bytes = bytes.len(),
        hash = %sha256_hex(&bytes),
        "saved"
    );
    Ok(Collected::Downloaded(path))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env();
    let dir = args.out_dir.clone().unwrap_or_else(|| config.download_dir.clone());

    let start = NaiveDate::from_ymd_opt(args.year, args.month, 1)
        .with_context(|| format!("Invalid period {}-{}", args.year, args.month))?;
    let end = match &args.until {
        Some(until) => parse_month(until)?,
        None => start,
    };
    let months = month_range(start, end);
    if months.is_empty() {
        anyhow::bail!("--until must not be before the start month");
    }

    println!("=== Banking Bulletin Collector ===");
    println!("Months: {} ({} to {})", months.len(), start.format("%Y-%m"), end.format("%Y-%m"));
    println!("Directory: {}", dir.display());

    if config.accept_invalid_certs {
        warn!("TLS certificate verification disabled");
    }
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .user_agent(USER_AGENT)
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .build()?;

    let mut downloaded = 0;
    let mut present = 0;
    let mut not_published = Vec::new();
    let mut failed = 0;

    for (i, month) in months.iter().enumerate() {
        if i > 0 {
            sleep(Duration::from_millis(config.rate_limit_ms)).await;
        }
        let period = month.format("%Y-%m").to_string();
        match collect_month(&client, &config, &dir, *month, &args).await {
            Ok(Collected::Downloaded(path)) => {
                println!("  ✓ {} -> {}", period, path.display());
                downloaded += 1;
            }
            Ok(Collected::Present(path)) => {
                println!("  = {} already at {}", period, path.display());
                present += 1;
            }
            Ok(Collected::NotPublished) => {
                warn!(period = %period, "bulletin not published");
                not_published.push(period);
            }
            Err(e) => {
                error!(period = %period, "download failed: {:#}", e);
                failed += 1;
            }
        }
    }

    println!("\n=== Collection Summary ===");
    println!("Downloaded: {}", downloaded);
    println!("Already present: {}", present);
    if !not_published.is_empty() {
        println!("Not published: {}", not_published.join(", "));
    }
    println!("Failed: {}", failed);

    if failed > 0 {
        anyhow::bail!("{} month(s) failed to download", failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ym(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    // -------------------------------------------------------------------------
    // URLS AND FILE NAMES
    // -------------------------------------------------------------------------

    #[test]
    fn test_bulletin_url_pads_month() {
        let url = bulletin_url("https://host/BE%20BM%20{year}{month}.xlsx", ym(2025, 6));
        assert_eq!(url, "https://host/BE%20BM%20202506.xlsx");
    }

    #[test]
    fn test_bulletin_url_padded_placeholders() {
        let url = bulletin_url("https://host/{year:04d}/{month:02d}.xlsx", ym(2024, 1));
        assert_eq!(url, "https://host/2024/01.xlsx");
    }

    #[test]
    fn test_default_url_has_placeholders() {
        let url = bulletin_url(DEFAULT_BASE_URL, ym(2025, 6));
        assert!(url.ends_with("BE%20BM%20202506.xlsx"));
        assert!(!url.contains('{'));
    }

    #[test]
    fn test_bulletin_file_name_carries_period() {
        assert_eq!(
            bulletin_file_name(ym(2023, 1)),
            "cnbv_boletin_banca_multiple_2023_01.xlsx"
        );
    }

    // -------------------------------------------------------------------------
    // MONTH RANGES
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_month() {
        assert_eq!(parse_month("2025-06").unwrap(), ym(2025, 6));
        assert_eq!(parse_month(" 2024-1 ").unwrap(), ym(2024, 1));
        assert!(parse_month("2025-13").is_err());
        assert!(parse_month("202506").is_err());
    }

    #[test]
    fn test_month_range_crosses_year() {
        let months = month_range(ym(2024, 11), ym(2025, 2));
        assert_eq!(months, vec![ym(2024, 11), ym(2024, 12), ym(2025, 1), ym(2025, 2)]);
    }

    #[test]
    fn test_month_range_single_and_reversed() {
        assert_eq!(month_range(ym(2024, 5), ym(2024, 5)), vec![ym(2024, 5)]);
        assert!(month_range(ym(2024, 5), ym(2024, 4)).is_empty());
    }

    // -------------------------------------------------------------------------
    // RETRY CLASSIFICATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_not_found_is_never_retried() {
        let err = FetchError::NotFound {
            url: "https://host/x".to_string(),
        };
        assert!(!err.is_transient());
        let err = FetchError::Status {
            url: "https://host/x".to_string(),
            status: StatusCode::SERVICE_UNAVAILABLE,
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 4), Duration::from_millis(4000));
    }

    #[test]
    fn test_backoff_saturates_on_large_attempts() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 34), base * u32::MAX);
        assert_eq!(backoff_delay(base, u32::MAX), base * u32::MAX);
        assert_eq!(backoff_delay(Duration::MAX, 3), Duration::MAX);
        assert_eq!(backoff_delay(base, 0), base);
    }

    #[test]
    fn test_retries_flag_is_bounded() {
        let parse = |retries: &str| {
            Args::try_parse_from(["collector", "--year", "2024", "--month", "1", "--retries", retries])
        };
        let args = Args::try_parse_from(["collector", "--year", "2024", "--month", "1"]).unwrap();
        assert_eq!(args.retries, 3);
        assert_eq!(parse("10").unwrap().retries, 10);
        assert!(parse("100").is_err());
        assert!(parse("0").is_err());
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    // -------------------------------------------------------------------------
    // STORAGE
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_save_to_fs_leaves_no_partial_file() {
        let dir = std::env::temp_dir().join(format!("collector-test-{}", std::process::id()));
        let path = save_to_fs(&dir, "b_2024_01.xlsx", b"PK").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"PK");
        assert!(!fs::try_exists(dir.join("b_2024_01.xlsx.part")).await.unwrap());
        fs::remove_dir_all(&dir).await.unwrap();
    }
}
