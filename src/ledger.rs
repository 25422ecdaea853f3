//! Durable record of which reporting periods have been delivered.

use crate::config::{is_valid_identifier, LedgerConfig};
use crate::error::LedgerError;
use crate::period::ReportingPeriod;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, error};

/// Status code stored for an accepted report.
pub const SUCCESS_CODE: u16 = 200;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DispatchRecord {
    #[sqlx(rename = "timestamp")]
    pub period: String,
    pub response: i64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DispatchLedger: Send + Sync {
    /// Create the backing table; an existing table is not an error.
    async fn ensure_schema(&self) -> Result<(), LedgerError>;

    /// True iff a `(period, 200)` row exists.
    async fn has_succeeded(&self, period: ReportingPeriod) -> Result<bool, LedgerError>;

    /// Append a row in its own transaction. Nothing is written on failure.
    async fn record_success(
        &self,
        period: ReportingPeriod,
        outcome_code: u16,
    ) -> Result<(), LedgerError>;
}

pub struct SqliteLedger {
    pool: SqlitePool,
    table: String,
}

impl SqliteLedger {
    pub async fn open(cfg: &LedgerConfig) -> Result<Self, LedgerError> {
        if !is_valid_identifier(&cfg.table) {
            return Err(LedgerError::InvalidTable(cfg.table.clone()));
        }
        let options = SqliteConnectOptions::new()
            .filename(&cfg.path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            table: cfg.table.clone(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// All rows in insertion order.
    pub async fn records(&self) -> Result<Vec<DispatchRecord>, LedgerError> {
        let sql = format!(
            "SELECT timestamp, response FROM {} ORDER BY rowid",
            self.table
        );
        Ok(sqlx::query_as::<_, DispatchRecord>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DispatchLedger for SqliteLedger {
    async fn ensure_schema(&self) -> Result<(), LedgerError> {
        let sql = format!(
            "CREATE TABLE {} (timestamp TEXT, response INTEGER)",
            self.table
        );
        match sqlx::query(&sql).execute(&self.pool).await {
            Ok(_) => {
                debug!(table = %self.table, "created ledger table");
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("already exists") => {
                debug!(table = %self.table, "ledger table already exists");
                Ok(())
            }
            Err(e) => Err(LedgerError::Db(e)),
        }
    }

    async fn has_succeeded(&self, period: ReportingPeriod) -> Result<bool, LedgerError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE timestamp = ? AND response = ?",
            self.table
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(period.to_string())
            .bind(i64::from(SUCCESS_CODE))
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn record_success(
        &self,
        period: ReportingPeriod,
        outcome_code: u16,
    ) -> Result<(), LedgerError> {
        let sql = format!(
            "INSERT INTO {} (timestamp, response) VALUES (?, ?)",
            self.table
        );
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(&sql)
            .bind(period.to_string())
            .bind(i64::from(outcome_code))
            .execute(&mut *tx)
            .await;

        if let Err(e) = inserted {
            error!(
                table = %self.table,
                period = %period,
                status = outcome_code,
                "could not insert dispatch record: {}", e
            );
            if let Err(rollback_err) = tx.rollback().await {
                error!(table = %self.table, "rollback failed: {}", rollback_err);
            }
            return Err(LedgerError::Db(e));
        }

        tx.commit().await?;
        debug!(table = %self.table, period = %period, status = outcome_code, "dispatch record inserted");
        Ok(())
    }
}
