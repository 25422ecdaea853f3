//! Monthly report dispatch: check the ledger, fetch, transform, send, record.
//!
//! Every stage returns a typed result and [`Dispatcher::run`] folds them into
//! a single [`TickOutcome`]. Nothing here returns an error to the scheduler;
//! an unresolved period simply stays open until a later tick delivers it.

use crate::config::ReportConfig;
use crate::delivery::{DeliveryResponse, ReportClient, ReportPayload};
use crate::error::{DeliveryError, InsufficientData, LedgerError, TelemetryError};
use crate::ledger::DispatchLedger;
use crate::period::ReportingPeriod;
use crate::series::{self, DerivativeSample, PowerSample};
use crate::telemetry::TelemetrySource;
use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// What the dispatcher needs from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSettings {
    pub measurement: String,
    pub field: String,
    pub email_address: String,
}

impl From<&ReportConfig> for ReportSettings {
    fn from(cfg: &ReportConfig) -> Self {
        Self {
            measurement: cfg.measurement.clone(),
            field: cfg.field.clone(),
            email_address: cfg.email_address.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TickFailure {
    #[error("no telemetry to report: {0}")]
    NoData(TelemetryError),
    #[error("telemetry query failed: {0}")]
    Telemetry(TelemetryError),
    #[error("not enough data: {0}")]
    InsufficientData(#[from] InsufficientData),
    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("report rejected with status {status}")]
    Rejected { status: u16 },
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl From<TelemetryError> for TickFailure {
    fn from(e: TelemetryError) -> Self {
        match e {
            TelemetryError::NoData { .. } => TickFailure::NoData(e),
            other => TickFailure::Telemetry(other),
        }
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    AlreadySent { period: ReportingPeriod },
    Delivered { period: ReportingPeriod, status: u16 },
    Failed { period: ReportingPeriod, reason: TickFailure },
}

impl TickOutcome {
    pub fn period(&self) -> ReportingPeriod {
        match self {
            TickOutcome::AlreadySent { period }
            | TickOutcome::Delivered { period, .. }
            | TickOutcome::Failed { period, .. } => *period,
        }
    }

    /// The one operator-facing line for this tick.
    pub fn log(&self) {
        match self {
            TickOutcome::AlreadySent { period } => {
                info!(period = %period, "report for month \"{}\" had already been sent", period)
            }
            TickOutcome::Delivered { period, status } => {
                info!(period = %period, status, "report for month \"{}\" delivered", period)
            }
            TickOutcome::Failed { period, reason } => match reason {
                TickFailure::NoData(_) | TickFailure::InsufficientData(_) => {
                    warn!(period = %period, "report for month \"{}\" not sent: {}", period, reason)
                }
                _ => error!(period = %period, "report for month \"{}\" not sent: {}", period, reason),
            },
        }
    }
}

pub struct Dispatcher<'a> {
    telemetry: &'a dyn TelemetrySource,
    ledger: &'a dyn DispatchLedger,
    client: &'a dyn ReportClient,
    settings: &'a ReportSettings,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        telemetry: &'a dyn TelemetrySource,
        ledger: &'a dyn DispatchLedger,
        client: &'a dyn ReportClient,
        settings: &'a ReportSettings,
    ) -> Self {
        Self {
            telemetry,
            ledger,
            client,
            settings,
        }
    }

    /// Run one tick for the month preceding `today`.
    pub async fn run(&self, today: NaiveDate) -> TickOutcome {
        let period = ReportingPeriod::preceding(today);

        match self.already_sent(period).await {
            Ok(true) => return TickOutcome::AlreadySent { period },
            Ok(false) => {}
            Err(reason) => return TickOutcome::Failed { period, reason },
        }

        match self.dispatch(period).await {
            Ok(status) => TickOutcome::Delivered { period, status },
            Err(reason) => TickOutcome::Failed { period, reason },
        }
    }

    async fn already_sent(&self, period: ReportingPeriod) -> Result<bool, TickFailure> {
        self.ledger.ensure_schema().await?;
        Ok(self.ledger.has_succeeded(period).await?)
    }

    async fn dispatch(&self, period: ReportingPeriod) -> Result<u16, TickFailure> {
        let raw = self.fetch().await?;
        let hourly = series::to_hourly_power(&raw)?;
        debug!(
            period = %period,
            raw = raw.len(),
            hourly = hourly.len(),
            "hourly power series prepared"
        );

        let response = self.send(&hourly).await?;
        if !response.is_accepted() {
            return Err(TickFailure::Rejected {
                status: response.status,
            });
        }

        self.ledger.record_success(period, response.status).await?;
        Ok(response.status)
    }

    async fn fetch(&self) -> Result<Vec<DerivativeSample>, TelemetryError> {
        let s = self.settings;
        let first = self
            .telemetry
            .first_timestamp(&s.measurement, &s.field, None)
            .await?;
        debug!(measurement = %s.measurement, first = %first, "earliest pulse sample");
        self.telemetry
            .hourly_derivative(&s.measurement, &s.field, first)
            .await
    }

    async fn send(&self, hourly: &[PowerSample]) -> Result<DeliveryResponse, DeliveryError> {
        let payload = ReportPayload {
            data: series::encode_series(hourly),
            email_address: self.settings.email_address.clone(),
        };
        self.client.send(&payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::MockReportClient;
    use crate::ledger::MockDispatchLedger;
    use crate::telemetry::MockTelemetrySource;
    use chrono::{DateTime, TimeZone, Utc};

    fn settings() -> ReportSettings {
        ReportSettings {
            measurement: "emontx3".into(),
            field: "pulse".into(),
            email_address: "ops@example.com".into(),
        }
    }

    fn june_2023() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 6, 12).unwrap()
    }

    fn may_2023() -> ReportingPeriod {
        ReportingPeriod::new(2023, 5).unwrap()
    }

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 5, 1, h, 0, 0).unwrap()
    }

    fn open_ledger() -> MockDispatchLedger {
        let mut ledger = MockDispatchLedger::new();
        ledger.expect_ensure_schema().times(1).returning(|| Ok(()));
        ledger
            .expect_has_succeeded()
            .withf(|p| *p == may_2023())
            .times(1)
            .returning(|_| Ok(false));
        ledger
    }

    fn telemetry_with(values: Vec<Option<f64>>) -> MockTelemetrySource {
        let mut telemetry = MockTelemetrySource::new();
        telemetry
            .expect_first_timestamp()
            .withf(|m, f, since| m == "emontx3" && f == "pulse" && since.is_none())
            .times(1)
            .returning(|_, _, _| Ok(hour(0)));
        telemetry
            .expect_hourly_derivative()
            .withf(|_, _, since| *since == hour(0))
            .times(1)
            .returning(move |_, _, _| {
                Ok(values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| DerivativeSample {
                        ts: hour(i as u32 + 1),
                        value: *v,
                    })
                    .collect())
            });
        telemetry
    }

    fn client_returning(status: u16) -> MockReportClient {
        let mut client = MockReportClient::new();
        client
            .expect_send()
            .withf(|p| p.email_address == "ops@example.com" && p.data.starts_with("{\"power\""))
            .times(1)
            .returning(move |_| {
                Ok(DeliveryResponse {
                    status,
                    body: "{}".into(),
                })
            });
        client
    }

    #[tokio::test]
    async fn test_already_sent_short_circuits() {
        let mut ledger = MockDispatchLedger::new();
        ledger.expect_ensure_schema().times(1).returning(|| Ok(()));
        ledger.expect_has_succeeded().times(1).returning(|_| Ok(true));
        ledger.expect_record_success().never();
        let mut telemetry = MockTelemetrySource::new();
        telemetry.expect_first_timestamp().never();
        telemetry.expect_hourly_derivative().never();
        let mut client = MockReportClient::new();
        client.expect_send().never();

        let settings = settings();
        let outcome = Dispatcher::new(&telemetry, &ledger, &client, &settings)
            .run(june_2023())
            .await;
        assert!(matches!(outcome, TickOutcome::AlreadySent { period } if period == may_2023()));
    }

    #[tokio::test]
    async fn test_delivered_records_success() {
        let mut ledger = open_ledger();
        ledger
            .expect_record_success()
            .withf(|p, code| *p == may_2023() && *code == 200)
            .times(1)
            .returning(|_, _| Ok(()));
        let telemetry = telemetry_with(vec![Some(100.0), Some(150.0), Some(230.0)]);
        let client = client_returning(200);

        let settings = settings();
        let outcome = Dispatcher::new(&telemetry, &ledger, &client, &settings)
            .run(june_2023())
            .await;
        assert!(matches!(outcome, TickOutcome::Delivered { status: 200, .. }));
        assert_eq!(outcome.period(), may_2023());
    }

    #[tokio::test]
    async fn test_rejected_does_not_record() {
        let mut ledger = open_ledger();
        ledger.expect_record_success().never();
        let telemetry = telemetry_with(vec![Some(100.0), Some(150.0)]);
        let client = client_returning(503);

        let settings = settings();
        let outcome = Dispatcher::new(&telemetry, &ledger, &client, &settings)
            .run(june_2023())
            .await;
        assert!(matches!(
            outcome,
            TickOutcome::Failed {
                reason: TickFailure::Rejected { status: 503 },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_insufficient_data_skips_send() {
        let mut ledger = open_ledger();
        ledger.expect_record_success().never();
        let telemetry = telemetry_with(vec![Some(20000.0), None, Some(120.0)]);
        let mut client = MockReportClient::new();
        client.expect_send().never();

        let settings = settings();
        let outcome = Dispatcher::new(&telemetry, &ledger, &client, &settings)
            .run(june_2023())
            .await;
        assert!(matches!(
            outcome,
            TickOutcome::Failed {
                reason: TickFailure::InsufficientData(InsufficientData { valid_points: 1 }),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_no_data_skips_everything_else() {
        let mut ledger = open_ledger();
        ledger.expect_record_success().never();
        let mut telemetry = MockTelemetrySource::new();
        telemetry.expect_first_timestamp().times(1).returning(|m, f, _| {
            Err(TelemetryError::NoData {
                measurement: m.to_string(),
                field: f.to_string(),
            })
        });
        telemetry.expect_hourly_derivative().never();
        let mut client = MockReportClient::new();
        client.expect_send().never();

        let settings = settings();
        let outcome = Dispatcher::new(&telemetry, &ledger, &client, &settings)
            .run(june_2023())
            .await;
        assert!(matches!(
            outcome,
            TickOutcome::Failed {
                reason: TickFailure::NoData(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_query_error_is_not_no_data() {
        let mut ledger = open_ledger();
        ledger.expect_record_success().never();
        let mut telemetry = MockTelemetrySource::new();
        telemetry
            .expect_first_timestamp()
            .returning(|_, _, _| Err(TelemetryError::Query("database not found".into())));
        let mut client = MockReportClient::new();
        client.expect_send().never();

        let settings = settings();
        let outcome = Dispatcher::new(&telemetry, &ledger, &client, &settings)
            .run(june_2023())
            .await;
        assert!(matches!(
            outcome,
            TickOutcome::Failed {
                reason: TickFailure::Telemetry(TelemetryError::Query(_)),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_delivery_error_does_not_record() {
        let mut ledger = open_ledger();
        ledger.expect_record_success().never();
        let telemetry = telemetry_with(vec![Some(1.0), Some(2.0)]);
        let mut client = MockReportClient::new();
        client.expect_send().times(1).returning(|_| {
            let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
            Err(DeliveryError::Json(err))
        });

        let settings = settings();
        let outcome = Dispatcher::new(&telemetry, &ledger, &client, &settings)
            .run(june_2023())
            .await;
        assert!(matches!(
            outcome,
            TickOutcome::Failed {
                reason: TickFailure::Delivery(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_ledger_read_error_stops_before_fetch() {
        let mut ledger = MockDispatchLedger::new();
        ledger.expect_ensure_schema().returning(|| Ok(()));
        ledger
            .expect_has_succeeded()
            .returning(|_| Err(LedgerError::InvalidTable("bad table".into())));
        let mut telemetry = MockTelemetrySource::new();
        telemetry.expect_first_timestamp().never();
        let mut client = MockReportClient::new();
        client.expect_send().never();

        let settings = settings();
        let outcome = Dispatcher::new(&telemetry, &ledger, &client, &settings)
            .run(june_2023())
            .await;
        assert!(matches!(
            outcome,
            TickOutcome::Failed {
                reason: TickFailure::Ledger(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_ledger_write_error_is_reported() {
        let mut ledger = open_ledger();
        ledger
            .expect_record_success()
            .times(1)
            .returning(|_, _| Err(LedgerError::InvalidTable("bad table".into())));
        let telemetry = telemetry_with(vec![Some(1.0), Some(2.0)]);
        let client = client_returning(200);

        let settings = settings();
        let outcome = Dispatcher::new(&telemetry, &ledger, &client, &settings)
            .run(june_2023())
            .await;
        assert!(matches!(
            outcome,
            TickOutcome::Failed {
                reason: TickFailure::Ledger(_),
                ..
            }
        ));
    }
}
