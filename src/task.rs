//! The scheduled reporting task: one dispatcher run per tick with freshly
//! acquired telemetry and ledger handles.

use crate::config::Config;
use crate::delivery::HttpReportClient;
use crate::dispatcher::{Dispatcher, ReportSettings, TickFailure, TickOutcome};
use crate::ledger::SqliteLedger;
use crate::period::ReportingPeriod;
use crate::scheduler::PeriodicTask;
use crate::telemetry::InfluxClient;
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

pub struct ReportTask {
    config: Arc<Config>,
    settings: ReportSettings,
}

impl ReportTask {
    pub fn new(config: Arc<Config>) -> Self {
        let settings = ReportSettings::from(&config.report);
        Self { config, settings }
    }

    /// Run the pipeline once as of `today`.
    pub async fn run_once(&self, today: NaiveDate) -> TickOutcome {
        let period = ReportingPeriod::preceding(today);
        let report = &self.config.report;

        let ledger = match SqliteLedger::open(&self.config.ledger).await {
            Ok(ledger) => ledger,
            Err(e) => {
                return TickOutcome::Failed {
                    period,
                    reason: TickFailure::Ledger(e),
                }
            }
        };

        let clients = InfluxClient::new(&self.config.influxdb, report.request_timeout())
            .map_err(TickFailure::from)
            .and_then(|telemetry| {
                HttpReportClient::new(
                    report.web_server_url.clone(),
                    report.request_timeout(),
                    report.accept_invalid_certs,
                )
                .map(|client| (telemetry, client))
                .map_err(TickFailure::from)
            });

        let outcome = match clients {
            Ok((telemetry, client)) => {
                Dispatcher::new(&telemetry, &ledger, &client, &self.settings)
                    .run(today)
                    .await
            }
            Err(reason) => TickOutcome::Failed { period, reason },
        };

        ledger.close().await;
        outcome
    }
}

#[async_trait]
impl PeriodicTask for ReportTask {
    fn name(&self) -> &str {
        "energy-consumption-report"
    }

    async fn run(&self) {
        info!("Starting reporting task");
        let started = Instant::now();
        let outcome = self.run_once(Local::now().date_naive()).await;
        outcome.log();
        info!(
            "Reporting task completed in {} seconds",
            started.elapsed().as_secs()
        );
    }
}
