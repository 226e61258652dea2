//! Migration trait definition

use crate::config::DbType;
use crate::executor::{LifeError, LifeExecutor};
use crate::schema::quote_ident;
use may_postgres::types::ToSql;
use may_postgres::Row;

/// One ordered unit of schema change, supplied by the application.
///
/// The orchestrator only sequences units: it runs `up()` at most once per
/// database (tracked by name in the ledger), inside a transaction unless
/// [`Migration::transaction`] opts out.
///
/// Note: this runs on the may runtime, so `up()`/`down()` are synchronous.
pub trait Migration: Send + Sync {
    /// Unique name, also the ledger key
    fn name(&self) -> &str;

    /// Creation timestamp (milliseconds), informational
    fn timestamp(&self) -> i64;

    /// Apply the migration
    ///
    /// # Errors
    ///
    /// Returns `LifeError` if any statement fails; the unit's transaction is rolled back.
    fn up(&self, ctx: &MigrationContext<'_>) -> Result<(), LifeError>;

    /// Undo the migration. Units without a `down()` cannot be reverted.
    ///
    /// # Errors
    ///
    /// Returns `LifeError` if any statement fails or the unit is irreversible.
    fn down(&self, ctx: &MigrationContext<'_>) -> Result<(), LifeError> {
        let _ = ctx;
        Err(LifeError::Other(format!(
            "Migration '{}' does not support reverting",
            self.name()
        )))
    }

    /// `false` runs the unit outside any transaction (e.g. `CREATE INDEX CONCURRENTLY`).
    fn transaction(&self) -> bool {
        true
    }

    /// `true` once wrapped by the instrumentation decorator.
    fn is_instrumented(&self) -> bool {
        false
    }
}

/// What a unit sees while running.
///
/// Statements issued through the context run on the unit's transaction when
/// it has one.
pub struct MigrationContext<'a> {
    executor: &'a dyn LifeExecutor,
    db_type: DbType,
    schema: &'a str,
    table_prefix: &'a str,
    name: &'a str,
}

impl<'a> MigrationContext<'a> {
    pub fn new(
        executor: &'a dyn LifeExecutor,
        db_type: DbType,
        schema: &'a str,
        table_prefix: &'a str,
        name: &'a str,
    ) -> Self {
        Self {
            executor,
            db_type,
            schema,
            table_prefix,
            name,
        }
    }

    pub fn executor(&self) -> &'a dyn LifeExecutor {
        self.executor
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }

    pub fn schema(&self) -> &str {
        self.schema
    }

    pub fn table_prefix(&self) -> &str {
        self.table_prefix
    }

    pub fn migration_name(&self) -> &str {
        self.name
    }

    /// Quoted table name with the configured prefix applied.
    pub fn escape_table(&self, table: &str) -> String {
        quote_ident(&format!("{}{table}", self.table_prefix))
    }
}

impl LifeExecutor for MigrationContext<'_> {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, LifeError> {
        self.executor.execute(query, params)
    }

    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, LifeError> {
        self.executor.query_one(query, params)
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, LifeError> {
        self.executor.query_all(query, params)
    }
}
