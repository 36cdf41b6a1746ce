use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the extraction pipeline.
///
/// `SourceFormat`, `PeriodFormat` and `Mapping` are scoped to a single
/// (file, family) contribution; callers record them and keep going.
#[derive(Debug, Error)]
pub enum Error {
    #[error("source format error in '{}' (sheet '{sheet}'): {reason}", file.display())]
    SourceFormat {
        file: PathBuf,
        sheet: String,
        reason: String,
    },

    #[error("no YYYY_MM period token in file name '{}'", file.display())]
    PeriodFormat { file: PathBuf },

    #[error("family '{family}' cannot be mapped: {reason}")]
    Mapping { family: String, reason: String },

    #[error("invalid family configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn source_format(
        file: impl Into<PathBuf>,
        sheet: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::SourceFormat {
            file: file.into(),
            sheet: sheet.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn mapping(family: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Mapping {
            family: family.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-friendly tag for run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::SourceFormat { .. } => "source_format",
            Error::PeriodFormat { .. } => "period_format",
            Error::Mapping { .. } => "mapping",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Csv(_) => "csv",
            Error::Json(_) => "json",
        }
    }
}
