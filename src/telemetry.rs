//! Pulse telemetry reader backed by the InfluxDB 1.x HTTP query API.

use crate::config::InfluxConfig;
use crate::error::TelemetryError;
use crate::series::DerivativeSample;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Timestamp of the earliest sample of `field`, optionally at or after `since`.
    async fn first_timestamp(
        &self,
        measurement: &str,
        field: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, TelemetryError>;

    /// Non-negative derivative of the hourly maximum of `field`, one row per
    /// hour from `since` onwards, empty hours null-filled. Empty when fewer
    /// than two hours hold samples.
    async fn hourly_derivative(
        &self,
        measurement: &str,
        field: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DerivativeSample>, TelemetryError>;
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
}

impl Series {
    fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

fn parse_response(body: &str) -> Result<Vec<Series>, TelemetryError> {
    let response: QueryResponse = serde_json::from_str(body)
        .map_err(|e| TelemetryError::Query(format!("malformed response: {}", e)))?;
    if let Some(err) = response.error {
        return Err(TelemetryError::Query(err));
    }
    let mut series = Vec::new();
    for result in response.results {
        if let Some(err) = result.error {
            return Err(TelemetryError::Query(err));
        }
        series.extend(result.series);
    }
    Ok(series)
}

fn parse_time(value: &Value) -> Result<DateTime<Utc>, TelemetryError> {
    let raw = value
        .as_str()
        .ok_or_else(|| TelemetryError::Query(format!("unexpected time value: {}", value)))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| TelemetryError::Query(format!("invalid time \"{}\": {}", raw, e)))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

fn time_literal(ts: DateTime<Utc>) -> String {
    format!("'{}'", ts.to_rfc3339_opts(SecondsFormat::Secs, true))
}

pub fn first_timestamp_query(measurement: &str, field: &str, since: Option<DateTime<Utc>>) -> String {
    let mut q = format!("SELECT {} FROM {}", quote_ident(field), quote_ident(measurement));
    if let Some(since) = since {
        q.push_str(&format!(" WHERE time >= {}", time_literal(since)));
    }
    q.push_str(" LIMIT 1");
    q
}

pub fn hourly_derivative_query(measurement: &str, field: &str, since: DateTime<Utc>) -> String {
    format!(
        "SELECT NON_NEGATIVE_DERIVATIVE(MAX({}), 1h) AS power FROM {} WHERE time >= {} GROUP BY time(1h) FILL(null)",
        quote_ident(field),
        quote_ident(measurement),
        time_literal(since)
    )
}

/// HTTP client for one InfluxDB database. Cheap to build; one per tick.
pub struct InfluxClient {
    http: reqwest::Client,
    base_url: String,
    database: String,
    username: String,
    password: String,
}

impl InfluxClient {
    pub fn new(cfg: &InfluxConfig, timeout: Duration) -> Result<Self, TelemetryError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let scheme = if cfg.ssl { "https" } else { "http" };
        Ok(Self {
            http,
            base_url: format!("{}://{}:{}", scheme, cfg.host, cfg.port),
            database: cfg.database.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    async fn query(&self, q: &str) -> Result<Vec<Series>, TelemetryError> {
        debug!(query = %q, "querying InfluxDB");
        let response = self
            .http
            .get(format!("{}/query", self.base_url))
            .query(&[
                ("db", self.database.as_str()),
                ("u", self.username.as_str()),
                ("p", self.password.as_str()),
                ("q", q),
            ])
            .send()
            .await?;
        Self::read_series(response).await
    }

    async fn execute(&self, q: &str) -> Result<(), TelemetryError> {
        debug!(query = %q, "executing InfluxDB statement");
        let response = self
            .http
            .post(format!("{}/query", self.base_url))
            .query(&[
                ("u", self.username.as_str()),
                ("p", self.password.as_str()),
                ("q", q),
            ])
            .send()
            .await?;
        Self::read_series(response).await.map(|_| ())
    }

    async fn read_series(response: reqwest::Response) -> Result<Vec<Series>, TelemetryError> {
        let status = response.status();
        let body = response.text().await?;
        match parse_response(&body) {
            Ok(series) if status.is_success() => Ok(series),
            Ok(_) => Err(TelemetryError::Query(format!("status {}: {}", status, body))),
            Err(e) => Err(e),
        }
    }

    /// Create the configured database when the server does not list it.
    /// Returns whether it had to be created.
    pub async fn ensure_database(&self) -> Result<bool, TelemetryError> {
        let series = self.query("SHOW DATABASES").await?;
        let names: Vec<&str> = series
            .iter()
            .flat_map(|s| s.values.iter())
            .filter_map(|row| row.first().and_then(Value::as_str))
            .collect();
        debug!(databases = ?names, "InfluxDB databases");
        if names.contains(&self.database.as_str()) {
            return Ok(false);
        }
        info!(database = %self.database, "InfluxDB database not found, creating it");
        self.execute(&format!("CREATE DATABASE {}", quote_ident(&self.database)))
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl TelemetrySource for InfluxClient {
    async fn first_timestamp(
        &self,
        measurement: &str,
        field: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, TelemetryError> {
        let series = self
            .query(&first_timestamp_query(measurement, field, since))
            .await?;
        let first = series
            .iter()
            .find_map(|s| Some((s.column("time")?, s.values.first()?)))
            .and_then(|(idx, row)| row.get(idx));
        match first {
            Some(value) => parse_time(value),
            None => Err(TelemetryError::NoData {
                measurement: measurement.to_string(),
                field: field.to_string(),
            }),
        }
    }

    async fn hourly_derivative(
        &self,
        measurement: &str,
        field: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DerivativeSample>, TelemetryError> {
        let series = self
            .query(&hourly_derivative_query(measurement, field, since))
            .await?;
        // A single populated hour has no derivative; the transformer reports it.
        let Some(series) = series.into_iter().next() else {
            debug!(measurement, field, "derivative query returned no series");
            return Ok(Vec::new());
        };
        let (Some(time_idx), Some(power_idx)) = (series.column("time"), series.column("power"))
        else {
            return Err(TelemetryError::Query(format!(
                "unexpected columns {:?}",
                series.columns
            )));
        };

        let samples = series
            .values
            .iter()
            .map(|row| {
                let ts = parse_time(row.get(time_idx).unwrap_or(&Value::Null))?;
                let value = row.get(power_idx).and_then(Value::as_f64);
                Ok(DerivativeSample { ts, value })
            })
            .collect::<Result<Vec<_>, TelemetryError>>()?;
        debug!(measurement = %measurement, count = samples.len(), "retrieved hourly derivative");
        Ok(samples)
    }
}
