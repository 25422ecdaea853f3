#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use energy_report::config::LedgerConfig;
use energy_report::delivery::{DeliveryResponse, ReportClient, ReportPayload};
use energy_report::error::{DeliveryError, TelemetryError};
use energy_report::series::DerivativeSample;
use energy_report::telemetry::TelemetrySource;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Ledger config pointing at a fresh SQLite file under the temp dir.
pub fn temp_ledger_config() -> LedgerConfig {
    LedgerConfig {
        path: std::env::temp_dir().join(format!("energy-report-{}.db", uuid::Uuid::new_v4())),
        table: "report_requests".into(),
    }
}

pub fn remove_ledger(cfg: &LedgerConfig) {
    std::fs::remove_file(&cfg.path).ok();
}

pub fn hour(h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(i64::from(h))
}

const SECS_PER_HOUR: i64 = 3600;

/// Cumulative pulse count as stored by the energy monitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub ts: DateTime<Utc>,
    pub pulses: f64,
}

/// Reproduce the store-side aggregation from raw cumulative counts: the
/// maximum per hour, then the per-hour rate of change between consecutive
/// populated hours. Empty hours and counter resets become `None`.
pub fn derive_hourly(raw: &[RawSample]) -> Vec<DerivativeSample> {
    let mut maxima: BTreeMap<i64, f64> = BTreeMap::new();
    for sample in raw {
        let hour = sample.ts.timestamp().div_euclid(SECS_PER_HOUR);
        maxima
            .entry(hour)
            .and_modify(|m| *m = m.max(sample.pulses))
            .or_insert(sample.pulses);
    }

    let (Some(&first), Some(&last)) = (maxima.keys().next(), maxima.keys().next_back()) else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity((last - first) as usize);
    let mut previous: Option<(i64, f64)> = maxima.get(&first).map(|m| (first, *m));
    for hour in (first + 1)..=last {
        let Some(ts) = DateTime::from_timestamp(hour * SECS_PER_HOUR, 0) else {
            continue;
        };
        let value = match (previous, maxima.get(&hour)) {
            (Some((prev_hour, prev_max)), Some(&current)) => {
                previous = Some((hour, current));
                let rate = (current - prev_max) / (hour - prev_hour) as f64;
                (rate >= 0.0).then_some(rate)
            }
            _ => None,
        };
        out.push(DerivativeSample { ts, value });
    }
    out
}

/// Telemetry source holding raw pulse counts; aggregates them the same way
/// the store does.
pub struct MemoryTelemetry {
    raw: Vec<RawSample>,
    derivative: Option<Vec<DerivativeSample>>,
    pub calls: AtomicUsize,
}

impl MemoryTelemetry {
    pub fn from_pulses(pulses: &[f64]) -> Self {
        let raw = pulses
            .iter()
            .enumerate()
            .map(|(i, p)| RawSample {
                ts: hour(i as u32),
                pulses: *p,
            })
            .collect();
        Self {
            raw,
            derivative: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Serve a precomputed derivative series instead of aggregating pulses.
    pub fn from_derivative(values: &[Option<f64>]) -> Self {
        let derivative = values
            .iter()
            .enumerate()
            .map(|(i, v)| DerivativeSample {
                ts: hour(i as u32 + 1),
                value: *v,
            })
            .collect();
        Self {
            raw: vec![RawSample {
                ts: hour(0),
                pulses: 0.0,
            }],
            derivative: Some(derivative),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self {
            raw: Vec::new(),
            derivative: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetrySource for MemoryTelemetry {
    async fn first_timestamp(
        &self,
        measurement: &str,
        field: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, TelemetryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.raw
            .iter()
            .map(|s| s.ts)
            .filter(|ts| since.map_or(true, |since| *ts >= since))
            .min()
            .ok_or_else(|| TelemetryError::NoData {
                measurement: measurement.to_string(),
                field: field.to_string(),
            })
    }

    async fn hourly_derivative(
        &self,
        _measurement: &str,
        _field: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DerivativeSample>, TelemetryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(derivative) = &self.derivative {
            return Ok(derivative.clone());
        }
        let raw: Vec<RawSample> = self.raw.iter().copied().filter(|s| s.ts >= since).collect();
        Ok(derive_hourly(&raw))
    }
}

/// Report client answering with a fixed status and keeping every payload.
pub struct RecordingClient {
    status: Mutex<u16>,
    pub sent: Mutex<Vec<ReportPayload>>,
}

impl RecordingClient {
    pub fn with_status(status: u16) -> Self {
        Self {
            status: Mutex::new(status),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_status(&self, status: u16) {
        *self.status.lock().unwrap() = status;
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl ReportClient for RecordingClient {
    async fn send(&self, payload: &ReportPayload) -> Result<DeliveryResponse, DeliveryError> {
        self.sent.lock().unwrap().push(payload.clone());
        Ok(DeliveryResponse {
            status: *self.status.lock().unwrap(),
            body: r#"{"message":"ok"}"#.into(),
        })
    }
}
