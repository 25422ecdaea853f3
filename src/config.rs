use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub influxdb: InfluxConfig,
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    #[serde(default = "default_influx_host")]
    pub host: String,
    #[serde(default = "default_influx_port")]
    pub port: u16,
    #[serde(default = "default_influx_database")]
    pub database: String,
    #[serde(default = "default_influx_credential")]
    pub username: String,
    #[serde(default = "default_influx_credential")]
    pub password: String,
    #[serde(default)]
    pub ssl: bool,
}

fn default_influx_host() -> String {
    "influxdb".into()
}

fn default_influx_port() -> u16 {
    8086
}

fn default_influx_database() -> String {
    "Emon".into()
}

fn default_influx_credential() -> String {
    "root".into()
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            host: default_influx_host(),
            port: default_influx_port(),
            database: default_influx_database(),
            username: default_influx_credential(),
            password: default_influx_credential(),
            ssl: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// "latitude,longitude" of the meter
    #[serde(default = "default_gps_location")]
    pub gps_location: String,
}

fn default_gps_location() -> String {
    "0.0,0.0".into()
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            gps_location: default_gps_location(),
        }
    }
}

impl SiteConfig {
    pub fn coordinates(&self) -> Result<(f64, f64), anyhow::Error> {
        let (lat, lon) = self
            .gps_location
            .split_once(',')
            .ok_or_else(|| anyhow::anyhow!("gps_location must be \"lat,lon\", got \"{}\"", self.gps_location))?;
        let lat: f64 = lat.trim().parse()?;
        let lon: f64 = lon.trim().parse()?;
        anyhow::ensure!((-90.0..=90.0).contains(&lat), "latitude out of range: {}", lat);
        anyhow::ensure!((-180.0..=180.0).contains(&lon), "longitude out of range: {}", lon);
        Ok((lat, lon))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Measurement holding the pulse counter
    #[serde(default = "default_measurement")]
    pub measurement: String,
    #[serde(default = "default_field")]
    pub field: String,
    /// Where the reporting service mails the report
    #[serde(default = "default_email_address")]
    pub email_address: String,
    #[serde(default = "default_web_server_url")]
    pub web_server_url: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub initial_delay_secs: u64,
    #[serde(default)]
    pub jitter_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_measurement() -> String {
    "emontx3".into()
}

fn default_field() -> String {
    "pulse".into()
}

fn default_email_address() -> String {
    "username@example.com".into()
}

fn default_web_server_url() -> String {
    "https://tdm-or5.jicsardegna.it/get_report".into()
}

fn default_interval_secs() -> u64 {
    60 * 60 * 24
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            measurement: default_measurement(),
            field: default_field(),
            email_address: default_email_address(),
            web_server_url: default_web_server_url(),
            interval_secs: default_interval_secs(),
            initial_delay_secs: 0,
            jitter_secs: 0,
            request_timeout_secs: default_request_timeout_secs(),
            accept_invalid_certs: false,
        }
    }
}

impl ReportConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_secs(self.jitter_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// SQLite file; created when missing
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
    #[serde(default = "default_ledger_table")]
    pub table: String,
}

fn default_ledger_path() -> PathBuf {
    "/sqlite_db/reporting.db".into()
}

fn default_ledger_table() -> String {
    "report_requests".into()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            table: default_ledger_table(),
        }
    }
}

pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards INFLUXDB_HOST, INFLUXDB_PASSWORD and REPORT_EMAIL_ADDRESS
    /// override whatever the YAML had.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, anyhow::Error> {
        let expanded = expand_env_placeholders(raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;

        if let Ok(host) = std::env::var("INFLUXDB_HOST") {
            cfg.influxdb.host = host;
        }
        if let Ok(password) = std::env::var("INFLUXDB_PASSWORD") {
            cfg.influxdb.password = password;
        }
        if let Ok(email) = std::env::var("REPORT_EMAIL_ADDRESS") {
            cfg.report.email_address = email;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let report = &self.report;
        anyhow::ensure!(!report.measurement.is_empty(), "report.measurement must not be empty");
        anyhow::ensure!(!report.field.is_empty(), "report.field must not be empty");
        anyhow::ensure!(
            !report.email_address.is_empty(),
            "report.email_address must not be empty"
        );
        anyhow::ensure!(
            report.web_server_url.starts_with("http://")
                || report.web_server_url.starts_with("https://"),
            "report.web_server_url must be an http(s) URL, got \"{}\"",
            report.web_server_url
        );
        anyhow::ensure!(report.interval_secs > 0, "report.interval_secs must be positive");
        anyhow::ensure!(
            is_valid_identifier(&self.ledger.table),
            "ledger.table is not a valid table name: \"{}\"",
            self.ledger.table
        );
        self.site.coordinates()?;
        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$".
fn expand_env_placeholders(input: &str) -> Result<String, anyhow::Error> {
    use anyhow::Context;

    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next(); // consume the opening delimiter
        let var = read_until(&mut it, close)
            .with_context(|| format!("unterminated env placeholder: missing '{}'", close))?;
        let val = std::env::var(&var)
            .with_context(|| format!("missing environment variable: {}", var))?;
        out.push_str(&val);
    }

    Ok(out)
}

/// Read characters until we hit `end`, returning the collected string.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}
