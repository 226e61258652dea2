//! Migrator - applies the configured migration units
//!
//! A run takes the migration lock, makes sure the ledger exists, skips every
//! unit already recorded there, and applies the rest in configured order. Each
//! unit's ledger record is written on the same executor as the unit itself,
//! so under `TransactionMode::Each` a unit and its record commit together.

use super::instrument::wrap_migrations;
use super::lock::MigrationLockGuard;
use super::migration::{Migration, MigrationContext};
use super::record::MigrationRecord;
use super::state_table::MigrationLedger;
use super::MigrationError;
use crate::config::{DbType, MigrationConfig, TransactionMode};
use crate::connection::ConnectionOptions;
use crate::executor::LifeExecutor;
use crate::transaction::run_in_transaction;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Core migration execution engine
pub struct Migrator {
    migrations: Vec<Arc<dyn Migration>>,
    ledger: Arc<dyn MigrationLedger>,
    db_type: DbType,
    schema: String,
    table_prefix: String,
    mode: TransactionMode,
    lock_timeout_seconds: Option<u64>,
}

impl Migrator {
    /// Builds a migrator over the options' migration list, instrumenting every unit.
    pub fn new(
        options: &ConnectionOptions,
        settings: &MigrationConfig,
        ledger: Arc<dyn MigrationLedger>,
    ) -> Self {
        // Advisory locks are a Postgres feature
        let lock_timeout_seconds = (settings.lock && options.db_type == DbType::Postgresdb)
            .then_some(settings.lock_timeout_seconds);

        Self {
            migrations: wrap_migrations(&options.migrations),
            ledger,
            db_type: options.db_type,
            schema: options.schema.clone(),
            table_prefix: options.table_prefix.clone(),
            mode: settings.transaction_mode,
            lock_timeout_seconds,
        }
    }

    /// Apply every pending unit and return the names applied.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::ExecutionFailed` for the first failing unit.
    /// Units before it stay applied under `TransactionMode::Each`.
    pub fn run(&self, executor: &dyn LifeExecutor) -> Result<Vec<String>, MigrationError> {
        self.check_unique()?;
        let _lock = self.lock(executor)?;
        self.ledger.ensure(executor)?;

        let pending = self.pending_units(executor)?;
        if pending.is_empty() {
            log::info!("No pending migrations");
            return Ok(Vec::new());
        }
        log::info!("{} pending migration(s)", pending.len());

        match self.mode {
            TransactionMode::All => {
                if let Some(unit) = pending.iter().find(|m| !m.transaction()) {
                    return Err(MigrationError::TransactionModeConflict(unit.name().to_string()));
                }
                run_in_transaction(executor, |tx| {
                    pending.iter().try_for_each(|unit| self.apply(tx, unit))
                })?;
            }
            TransactionMode::Each => {
                for unit in &pending {
                    if unit.transaction() {
                        run_in_transaction(executor, |tx| self.apply(tx, unit))?;
                    } else {
                        self.apply(executor, unit)?;
                    }
                }
            }
            TransactionMode::None => {
                for unit in &pending {
                    self.apply(executor, unit)?;
                }
            }
        }

        Ok(pending.iter().map(|m| m.name().to_string()).collect())
    }

    /// Names of configured units not yet in the ledger, in configured order.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Database` if the ledger cannot be read.
    pub fn pending(&self, executor: &dyn LifeExecutor) -> Result<Vec<String>, MigrationError> {
        self.ledger.ensure(executor)?;
        Ok(self
            .pending_units(executor)?
            .iter()
            .map(|m| m.name().to_string())
            .collect())
    }

    /// Revert the most recently applied unit and drop its ledger record.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::NothingToRevert` when the ledger is empty and
    /// `MigrationError::UnknownMigration` when the last record has no unit.
    pub fn undo_last(&self, executor: &dyn LifeExecutor) -> Result<String, MigrationError> {
        let _lock = self.lock(executor)?;
        self.ledger.ensure(executor)?;

        let last = self
            .ledger
            .applied(executor)?
            .pop()
            .ok_or(MigrationError::NothingToRevert)?;
        let unit = self
            .migrations
            .iter()
            .find(|m| m.name() == last.name)
            .ok_or_else(|| MigrationError::UnknownMigration(last.name.clone()))?;

        if unit.transaction() && self.mode != TransactionMode::None {
            run_in_transaction(executor, |tx| self.revert(tx, unit))?;
        } else {
            self.revert(executor, unit)?;
        }

        Ok(last.name)
    }

    fn check_unique(&self) -> Result<(), MigrationError> {
        let mut seen = HashSet::new();
        for unit in &self.migrations {
            if !seen.insert(unit.name()) {
                return Err(MigrationError::DuplicateMigration(unit.name().to_string()));
            }
        }
        Ok(())
    }

    fn lock<'e>(
        &self,
        executor: &'e dyn LifeExecutor,
    ) -> Result<Option<MigrationLockGuard<'e>>, MigrationError> {
        self.lock_timeout_seconds
            .map(|timeout| MigrationLockGuard::acquire(executor, timeout))
            .transpose()
    }

    fn pending_units(
        &self,
        executor: &dyn LifeExecutor,
    ) -> Result<Vec<Arc<dyn Migration>>, MigrationError> {
        let applied: HashSet<String> = self
            .ledger
            .applied(executor)?
            .into_iter()
            .map(|record| record.name)
            .collect();

        Ok(self
            .migrations
            .iter()
            .filter(|m| !applied.contains(m.name()))
            .cloned()
            .collect())
    }

    fn context<'a>(
        &'a self,
        executor: &'a dyn LifeExecutor,
        unit: &'a Arc<dyn Migration>,
    ) -> MigrationContext<'a> {
        MigrationContext::new(
            executor,
            self.db_type,
            &self.schema,
            &self.table_prefix,
            unit.name(),
        )
    }

    fn apply(
        &self,
        executor: &dyn LifeExecutor,
        unit: &Arc<dyn Migration>,
    ) -> Result<(), MigrationError> {
        let start = Instant::now();
        unit.up(&self.context(executor, unit))
            .map_err(|error| MigrationError::ExecutionFailed {
                timestamp: unit.timestamp(),
                name: unit.name().to_string(),
                error,
            })?;

        let elapsed_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
        let record = MigrationRecord::new(unit.timestamp(), unit.name(), Some(elapsed_ms));
        self.ledger.record(executor, &record)?;
        Ok(())
    }

    fn revert(
        &self,
        executor: &dyn LifeExecutor,
        unit: &Arc<dyn Migration>,
    ) -> Result<(), MigrationError> {
        unit.down(&self.context(executor, unit))
            .map_err(|error| MigrationError::ExecutionFailed {
                timestamp: unit.timestamp(),
                name: unit.name().to_string(),
                error,
            })?;
        self.ledger.remove(executor, unit.name())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::test_helpers::{FakeExecutor, MemoryLedger, RecordingMigration};

    struct Fixture {
        fake: FakeExecutor,
        ledger: Arc<MemoryLedger>,
        units: Vec<Arc<RecordingMigration>>,
    }

    impl Fixture {
        fn new(names: &[&str]) -> Self {
            let fake = FakeExecutor::new();
            let units = names
                .iter()
                .enumerate()
                .map(|(i, name)| Arc::new(RecordingMigration::new(*name, i as i64 + 1)))
                .collect();
            Self {
                ledger: Arc::new(MemoryLedger::new(fake.clone())),
                fake,
                units,
            }
        }

        fn migrator(&self, settings: MigrationConfig) -> Migrator {
            let migrations = self
                .units
                .iter()
                .map(|u| Arc::clone(u) as Arc<dyn Migration>)
                .collect();
            let options = ConnectionOptions::from_config(&DatabaseConfig::default(), migrations);
            Migrator::new(&options, &settings, self.ledger.clone())
        }

        fn applied(&self) -> Vec<String> {
            self.ledger.applied_names()
        }
    }

    fn each() -> MigrationConfig {
        MigrationConfig::default()
    }

    #[test]
    fn test_runs_all_units_each_in_own_transaction() {
        let f = Fixture::new(&["A1", "B2", "C3"]);

        let applied = f.migrator(each()).run(&f.fake).unwrap();

        assert_eq!(applied, vec!["A1", "B2", "C3"]);
        assert_eq!(f.applied(), vec!["A1", "B2", "C3"]);
        assert_eq!(f.fake.count("BEGIN"), 3);
        assert_eq!(f.fake.count("COMMIT"), 3);
        assert_eq!(f.fake.count("SELECT pg_advisory_lock("), 1);
        assert_eq!(f.fake.count("SELECT pg_advisory_unlock("), 1);
    }

    #[test]
    fn test_failure_keeps_earlier_units_and_rerun_skips_them() {
        let f = Fixture::new(&["A1", "B2", "C3"]);
        f.units[1].set_failing(true);

        let err = f.migrator(each()).run(&f.fake).unwrap_err();

        assert!(matches!(err, MigrationError::ExecutionFailed { ref name, .. } if name == "B2"));
        assert_eq!(f.applied(), vec!["A1"]);
        assert!(f.fake.committed().iter().any(|s| s.contains("\"a1\"")));
        assert!(!f.fake.committed().iter().any(|s| s.contains("\"b2\"")));
        assert_eq!(f.units[2].up_calls(), 0);

        f.units[1].set_failing(false);
        let applied = f.migrator(each()).run(&f.fake).unwrap();

        assert_eq!(applied, vec!["B2", "C3"]);
        assert_eq!(f.units[0].up_calls(), 1);
        assert_eq!(f.applied(), vec!["A1", "B2", "C3"]);
    }

    #[test]
    fn test_all_mode_rolls_back_whole_batch() {
        let f = Fixture::new(&["A1", "B2"]);
        f.units[1].set_failing(true);
        let settings = MigrationConfig {
            transaction_mode: TransactionMode::All,
            ..MigrationConfig::default()
        };

        assert!(f.migrator(settings).run(&f.fake).is_err());

        assert!(f.applied().is_empty());
        assert_eq!(f.fake.count("BEGIN"), 1);
        assert_eq!(f.fake.count("ROLLBACK"), 1);
    }

    #[test]
    fn test_all_mode_rejects_non_transactional_unit() {
        let fake = FakeExecutor::new();
        let ledger = Arc::new(MemoryLedger::new(fake.clone()));
        let unit: Arc<dyn Migration> = Arc::new(RecordingMigration::new("Idx1", 1).non_transactional());
        let options = ConnectionOptions::from_config(&DatabaseConfig::default(), vec![unit]);
        let settings = MigrationConfig {
            transaction_mode: TransactionMode::All,
            ..MigrationConfig::default()
        };

        let err = Migrator::new(&options, &settings, ledger).run(&fake).unwrap_err();
        assert!(matches!(err, MigrationError::TransactionModeConflict(_)));
    }

    #[test]
    fn test_non_transactional_unit_runs_bare_in_each_mode() {
        let fake = FakeExecutor::new();
        let ledger = Arc::new(MemoryLedger::new(fake.clone()));
        let unit: Arc<dyn Migration> = Arc::new(RecordingMigration::new("Idx1", 1).non_transactional());
        let options = ConnectionOptions::from_config(&DatabaseConfig::default(), vec![unit]);

        Migrator::new(&options, &each(), ledger.clone()).run(&fake).unwrap();

        assert_eq!(fake.count("BEGIN"), 0);
        assert_eq!(ledger.applied_names(), vec!["Idx1"]);
    }

    #[test]
    fn test_duplicate_names_rejected_before_running() {
        let f = Fixture::new(&["A1", "A1"]);

        let err = f.migrator(each()).run(&f.fake).unwrap_err();

        assert!(matches!(err, MigrationError::DuplicateMigration(ref name) if name == "A1"));
        assert!(f.fake.statements().is_empty());
    }

    #[test]
    fn test_lock_can_be_disabled() {
        let f = Fixture::new(&["A1"]);
        let settings = MigrationConfig {
            lock: false,
            ..MigrationConfig::default()
        };

        f.migrator(settings).run(&f.fake).unwrap();
        assert_eq!(f.fake.count("SELECT pg_advisory_lock("), 0);
    }

    #[test]
    fn test_pending_and_undo_last() {
        let f = Fixture::new(&["A1", "B2"]);
        let migrator = f.migrator(each());
        assert_eq!(migrator.pending(&f.fake).unwrap(), vec!["A1", "B2"]);

        migrator.run(&f.fake).unwrap();
        assert!(migrator.pending(&f.fake).unwrap().is_empty());

        assert_eq!(migrator.undo_last(&f.fake).unwrap(), "B2");
        assert_eq!(f.units[1].down_calls(), 1);
        assert_eq!(migrator.pending(&f.fake).unwrap(), vec!["B2"]);
        assert_eq!(f.applied(), vec!["A1"]);
    }

    #[test]
    fn test_undo_last_on_empty_ledger() {
        let f = Fixture::new(&["A1"]);
        let err = f.migrator(each()).undo_last(&f.fake).unwrap_err();
        assert!(matches!(err, MigrationError::NothingToRevert));
    }
}
