//! `MigrationRecord` - one row of the migrations ledger

use crate::executor::LifeError;
use chrono::{DateTime, Utc};

/// An applied migration as stored in the `<prefix>migrations` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    /// Unit timestamp, as reported by `Migration::timestamp()`
    pub timestamp: i64,

    /// Unit name, unique in the ledger
    pub name: String,

    /// When the migration was applied
    pub applied_at: DateTime<Utc>,

    /// Execution time in milliseconds (`None` if not recorded)
    pub execution_time_ms: Option<i64>,
}

impl MigrationRecord {
    #[must_use]
    pub fn new(timestamp: i64, name: impl Into<String>, execution_time_ms: Option<i64>) -> Self {
        Self {
            timestamp,
            name: name.into(),
            applied_at: Utc::now(),
            execution_time_ms,
        }
    }

    /// Create a `MigrationRecord` from a database row
    ///
    /// Expected column order: `timestamp`, `name`, `applied_at`, `execution_time_ms`
    ///
    /// # Errors
    ///
    /// Returns `LifeError::ParseError` if a column has an unexpected type.
    pub fn from_row(row: &may_postgres::Row) -> Result<Self, LifeError> {
        let parse = |column: &str, e: may_postgres::Error| {
            LifeError::ParseError(format!("migrations.{column}: {e}"))
        };

        Ok(Self {
            timestamp: row.try_get(0).map_err(|e| parse("timestamp", e))?,
            name: row.try_get(1).map_err(|e| parse("name", e))?,
            applied_at: row.try_get(2).map_err(|e| parse("applied_at", e))?,
            execution_time_ms: row.try_get(3).map_err(|e| parse("execution_time_ms", e))?,
        })
    }
}
