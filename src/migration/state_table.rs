//! Migration state table management
//!
//! The ledger records which units have been applied, keyed by name. Every
//! write goes through the executor it is given, so a record made inside a
//! unit's transaction commits or rolls back together with the unit.

use super::record::MigrationRecord;
use crate::executor::{LifeError, LifeExecutor};
use crate::schema::quote_ident;

/// Storage for applied-migration records.
pub trait MigrationLedger: Send + Sync {
    /// Create the ledger if it does not exist yet
    ///
    /// # Errors
    ///
    /// Returns `LifeError` if the ledger cannot be created.
    fn ensure(&self, executor: &dyn LifeExecutor) -> Result<(), LifeError>;

    /// Applied records, oldest first
    ///
    /// # Errors
    ///
    /// Returns `LifeError` if the ledger cannot be read.
    fn applied(&self, executor: &dyn LifeExecutor) -> Result<Vec<MigrationRecord>, LifeError>;

    /// # Errors
    ///
    /// Returns `LifeError` if the record cannot be written.
    fn record(&self, executor: &dyn LifeExecutor, record: &MigrationRecord) -> Result<(), LifeError>;

    /// # Errors
    ///
    /// Returns `LifeError` if the record cannot be deleted.
    fn remove(&self, executor: &dyn LifeExecutor, name: &str) -> Result<(), LifeError>;
}

/// The `<prefix>migrations` table in the configured schema.
#[derive(Debug, Clone)]
pub struct StateTable {
    table: String,
}

impl StateTable {
    pub fn new(table_prefix: &str) -> Self {
        Self {
            table: format!("{table_prefix}migrations"),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn quoted(&self) -> String {
        quote_ident(&self.table)
    }
}

impl MigrationLedger for StateTable {
    fn ensure(&self, executor: &dyn LifeExecutor) -> Result<(), LifeError> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                timestamp BIGINT NOT NULL,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                execution_time_ms BIGINT
            )
            "#,
            self.quoted()
        );
        executor.execute(&sql, &[])?;
        Ok(())
    }

    fn applied(&self, executor: &dyn LifeExecutor) -> Result<Vec<MigrationRecord>, LifeError> {
        let sql = format!(
            "SELECT timestamp, name, applied_at, execution_time_ms FROM {} ORDER BY id",
            self.quoted()
        );
        executor
            .query_all(&sql, &[])?
            .iter()
            .map(MigrationRecord::from_row)
            .collect()
    }

    fn record(&self, executor: &dyn LifeExecutor, record: &MigrationRecord) -> Result<(), LifeError> {
        let sql = format!(
            "INSERT INTO {} (timestamp, name, applied_at, execution_time_ms) VALUES ($1, $2, $3, $4)",
            self.quoted()
        );
        executor.execute(
            &sql,
            &[
                &record.timestamp,
                &record.name,
                &record.applied_at,
                &record.execution_time_ms,
            ],
        )?;
        Ok(())
    }

    fn remove(&self, executor: &dyn LifeExecutor, name: &str) -> Result<(), LifeError> {
        let sql = format!("DELETE FROM {} WHERE name = $1", self.quoted());
        executor.execute(&sql, &[&name])?;
        Ok(())
    }
}
