//! Instrumentation decorator for migration units
//!
//! Wrapping adds logging, timing, metrics and a tracing span around `up()` and
//! `down()`; everything else is delegated untouched. Already-wrapped units
//! pass through, so wrapping a list twice is the same as wrapping it once.

use super::migration::{Migration, MigrationContext};
use crate::executor::LifeError;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// A migration unit wrapped with instrumentation.
pub struct InstrumentedMigration {
    inner: Arc<dyn Migration>,
}

impl InstrumentedMigration {
    fn observe(
        &self,
        direction: &'static str,
        run: impl FnOnce() -> Result<(), LifeError>,
    ) -> Result<(), LifeError> {
        let name = self.inner.name();

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::migration_span(name, direction).entered();

        log::info!("Starting migration {name} ({direction})");
        let start = Instant::now();
        let result = run();
        let elapsed = start.elapsed();

        #[cfg(feature = "metrics")]
        METRICS.record_migration(direction, elapsed, result.is_ok());

        match &result {
            Ok(()) => log::info!("Finished migration {name} ({direction}) in {}", format_elapsed(elapsed)),
            Err(e) => log::error!(
                "Migration {name} ({direction}) failed after {}: {e}",
                format_elapsed(elapsed)
            ),
        }
        result
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    format!("{}ms", elapsed.as_millis())
}

impl Migration for InstrumentedMigration {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn timestamp(&self) -> i64 {
        self.inner.timestamp()
    }

    fn up(&self, ctx: &MigrationContext<'_>) -> Result<(), LifeError> {
        self.observe("up", || self.inner.up(ctx))
    }

    fn down(&self, ctx: &MigrationContext<'_>) -> Result<(), LifeError> {
        self.observe("down", || self.inner.down(ctx))
    }

    fn transaction(&self) -> bool {
        self.inner.transaction()
    }

    fn is_instrumented(&self) -> bool {
        true
    }
}

/// Wraps one unit, leaving an already-wrapped unit as it is.
pub fn instrument(migration: Arc<dyn Migration>) -> Arc<dyn Migration> {
    if migration.is_instrumented() {
        migration
    } else {
        Arc::new(InstrumentedMigration { inner: migration })
    }
}

/// Returns a new list with every unit instrumented, in the same order.
pub fn wrap_migrations(migrations: &[Arc<dyn Migration>]) -> Vec<Arc<dyn Migration>> {
    migrations.iter().cloned().map(instrument).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbType;
    use crate::test_helpers::{FakeExecutor, RecordingMigration};

    #[test]
    fn test_wrapping_is_idempotent() {
        let units: Vec<Arc<dyn Migration>> = vec![
            Arc::new(RecordingMigration::new("A1", 1)),
            Arc::new(RecordingMigration::new("B2", 2)),
        ];

        let once = wrap_migrations(&units);
        let twice = wrap_migrations(&once);

        assert!(once.iter().all(|m| m.is_instrumented()));
        assert!(!units[0].is_instrumented());
        for (a, b) in once.iter().zip(&twice) {
            assert!(Arc::ptr_eq(a, b));
        }
        assert_eq!(
            twice.iter().map(|m| m.name()).collect::<Vec<_>>(),
            vec!["A1", "B2"]
        );
    }

    #[test]
    fn test_wrapper_delegates_once() {
        let unit = Arc::new(RecordingMigration::new("A1", 1).non_transactional());
        let wrapped = wrap_migrations(&wrap_migrations(&[unit.clone() as Arc<dyn Migration>]));
        let fake = FakeExecutor::new();
        let ctx = MigrationContext::new(&fake, DbType::Postgresdb, "public", "", "A1");

        wrapped[0].up(&ctx).unwrap();

        assert_eq!(unit.up_calls(), 1);
        assert!(!wrapped[0].transaction());
        assert_eq!(wrapped[0].timestamp(), 1);
    }

    #[test]
    fn test_wrapper_passes_errors_through() {
        let unit = Arc::new(RecordingMigration::new("Bad3", 3).failing());
        let wrapped = instrument(unit);
        let fake = FakeExecutor::new();
        let ctx = MigrationContext::new(&fake, DbType::Postgresdb, "public", "", "Bad3");

        assert!(wrapped.up(&ctx).is_err());
    }
}
