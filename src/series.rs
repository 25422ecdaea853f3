//! Hourly power series derived from cumulative pulse counts.
//!
//! The telemetry store delivers one derivative point per hour (pulses per
//! hour, i.e. average power over that hour). Counter resets and sensor noise
//! show up as nulls, negatives or implausibly large values; they are dropped
//! here before the hourly means are taken.

use crate::error::InsufficientData;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Readings at or above this value are treated as sensor faults.
pub const SENSOR_FAULT_THRESHOLD: f64 = 15000.0;

/// Fewer valid hours than this cannot be reported.
pub const MIN_HOURLY_POINTS: usize = 2;

const SECS_PER_HOUR: i64 = 3600;

/// One row of the store-side `NON_NEGATIVE_DERIVATIVE(MAX(pulse), 1h)` query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivativeSample {
    pub ts: DateTime<Utc>,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSample {
    pub hour_start: DateTime<Utc>,
    pub power: f64,
}

pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp().div_euclid(SECS_PER_HOUR) * SECS_PER_HOUR;
    DateTime::from_timestamp(secs, 0).unwrap_or(ts)
}

fn is_valid_power(value: f64) -> bool {
    value.is_finite() && (0.0..SENSOR_FAULT_THRESHOLD).contains(&value)
}

/// Clean the derivative series and average it onto an hourly grid.
///
/// Hours without a single valid point are left out rather than zero-filled.
pub fn to_hourly_power(samples: &[DerivativeSample]) -> Result<Vec<PowerSample>, InsufficientData> {
    let mut buckets: BTreeMap<DateTime<Utc>, (f64, u32)> = BTreeMap::new();
    for sample in samples {
        let Some(value) = sample.value.filter(|v| is_valid_power(*v)) else {
            continue;
        };
        let bucket = buckets.entry(truncate_to_hour(sample.ts)).or_insert((0.0, 0));
        bucket.0 += value;
        bucket.1 += 1;
    }

    if buckets.len() < MIN_HOURLY_POINTS {
        return Err(InsufficientData {
            valid_points: buckets.len(),
        });
    }

    Ok(buckets
        .into_iter()
        .map(|(hour_start, (sum, count))| PowerSample {
            hour_start,
            power: sum / f64::from(count),
        })
        .collect())
}

/// Column-oriented JSON with epoch-millisecond keys:
/// `{"power":{"1685577600000":100.0,...}}`.
pub fn encode_series(samples: &[PowerSample]) -> String {
    let column: Map<String, Value> = samples
        .iter()
        .map(|s| (s.hour_start.timestamp_millis().to_string(), Value::from(s.power)))
        .collect();
    let mut frame = Map::new();
    frame.insert("power".to_string(), Value::Object(column));
    Value::Object(frame).to_string()
}
