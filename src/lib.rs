pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod period;
pub mod scheduler;
pub mod series;
pub mod task;
pub mod telemetry;

pub use config::Config;
pub use dispatcher::{Dispatcher, ReportSettings, TickFailure, TickOutcome};
pub use error::{AppError, Result};
pub use period::ReportingPeriod;
