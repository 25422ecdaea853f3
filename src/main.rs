use energy_report::config::Config;
use energy_report::scheduler::Scheduler;
use energy_report::task::ReportTask;
use energy_report::telemetry::InfluxClient;
use energy_report::AppError;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Starting energy-report");

    let cfg_path = std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.yaml".into());
    let cfg = Config::load(&cfg_path).map_err(|e| AppError::Config(format!("{}: {:#}", cfg_path, e)))?;
    let (latitude, longitude) = cfg.site.coordinates()?;
    info!(
        measurement = %cfg.report.measurement,
        latitude,
        longitude,
        interval_secs = cfg.report.interval_secs,
        "Configuration loaded"
    );

    // The only fatal runtime condition: the telemetry store must be reachable at startup.
    let influx = InfluxClient::new(&cfg.influxdb, cfg.report.request_timeout())
        .map_err(AppError::Telemetry)?;
    if influx.ensure_database().await.map_err(AppError::Telemetry)? {
        info!(database = %influx.database(), "created InfluxDB database");
    }
    info!(
        host = %cfg.influxdb.host,
        port = cfg.influxdb.port,
        database = %influx.database(),
        "Connected to InfluxDB"
    );

    let cfg = Arc::new(cfg);
    let task = Arc::new(ReportTask::new(cfg.clone()));
    let mut scheduler = Scheduler::new();
    scheduler.register(
        task,
        cfg.report.initial_delay(),
        cfg.report.interval(),
        cfg.report.jitter(),
    );
    scheduler.run().await;

    info!("Application shutdown complete");
    Ok(())
}
