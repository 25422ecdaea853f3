use thiserror::Error;

/// Errors that abort startup. Per-tick failures never surface as `AppError`;
/// they are folded into [`crate::dispatcher::TickOutcome`].
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("no samples found for field \"{field}\" in measurement \"{measurement}\"")]
    NoData { measurement: String, field: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("query failed: {0}")]
    Query(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{valid_points} valid hourly point(s) after cleaning, at least 2 required")]
pub struct InsufficientData {
    pub valid_points: usize,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("DB error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("invalid table name \"{0}\"")]
    InvalidTable(String),
}
