//! Advisory-lock based migration mutex
//!
//! Only one process may run migrations against a database at a time. The lock
//! is a PostgreSQL session-level advisory lock, so a process that dies while
//! holding it releases it with its session.

use crate::executor::{LifeError, LifeExecutor};
use crate::migration::MigrationError;
use may_postgres::error::SqlState;

/// Advisory lock key shared by every process migrating with this crate ("lifebuoy")
pub const MIGRATION_LOCK_KEY: i64 = 0x6c69_6665_6275_6f79;

/// Lock guard that releases the advisory lock when dropped
pub struct MigrationLockGuard<'a> {
    executor: &'a dyn LifeExecutor,
}

impl<'a> MigrationLockGuard<'a> {
    /// Acquire the migration lock, waiting at most `timeout_seconds`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockTimeout` if another session keeps the lock
    /// past the timeout, or `MigrationError::Database` for any other failure.
    pub fn acquire(
        executor: &'a dyn LifeExecutor,
        timeout_seconds: u64,
    ) -> Result<Self, MigrationError> {
        acquire_migration_lock(executor, timeout_seconds)?;
        Ok(Self { executor })
    }
}

impl Drop for MigrationLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = release_migration_lock(self.executor) {
            log::warn!("Failed to release migration lock: {e}");
        }
    }
}

/// Blocks on `pg_advisory_lock` under a session `lock_timeout`.
///
/// # Errors
///
/// Returns `MigrationError::LockTimeout` when the wait is cancelled by `lock_timeout`.
pub fn acquire_migration_lock(
    executor: &dyn LifeExecutor,
    timeout_seconds: u64,
) -> Result<(), MigrationError> {
    executor.execute(&format!("SET lock_timeout = '{timeout_seconds}s'"), &[])?;

    let result = executor.execute(&format!("SELECT pg_advisory_lock({MIGRATION_LOCK_KEY})"), &[]);

    // lock_timeout is session-level; never leak it into the migrations themselves
    if let Err(e) = executor.execute("RESET lock_timeout", &[]) {
        log::warn!("Failed to reset lock_timeout: {e}");
    }

    match result {
        Ok(_) => {
            log::debug!("Acquired migration lock {MIGRATION_LOCK_KEY}");
            Ok(())
        }
        Err(e) if is_lock_timeout(&e) => {
            Err(MigrationError::LockTimeout(format!(
                "Failed to acquire migration lock within {timeout_seconds} seconds"
            )))
        }
        Err(e) => Err(MigrationError::Database(e)),
    }
}

/// `lock_timeout` cancels the waiting statement with SQLSTATE 55P03.
fn is_lock_timeout(err: &LifeError) -> bool {
    match err {
        LifeError::PostgresError(e) => is_lock_not_available(e.code()),
        _ => false,
    }
}

fn is_lock_not_available(code: Option<&SqlState>) -> bool {
    code == Some(&SqlState::LOCK_NOT_AVAILABLE)
}

/// # Errors
///
/// Returns `MigrationError::Database` if the unlock statement fails.
pub fn release_migration_lock(executor: &dyn LifeExecutor) -> Result<(), MigrationError> {
    executor.execute(&format!("SELECT pg_advisory_unlock({MIGRATION_LOCK_KEY})"), &[])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::FakeExecutor;

    #[test]
    fn test_guard_locks_and_unlocks() {
        let fake = FakeExecutor::new();
        {
            let _guard = MigrationLockGuard::acquire(&fake, 5).unwrap();
            assert_eq!(fake.count("SELECT pg_advisory_lock("), 1);
            assert_eq!(fake.count("RESET lock_timeout"), 1);
        }
        assert_eq!(fake.count("SELECT pg_advisory_unlock("), 1);
    }

    #[test]
    fn test_lock_not_available_is_a_timeout() {
        assert!(is_lock_not_available(Some(&SqlState::LOCK_NOT_AVAILABLE)));
        assert!(!is_lock_not_available(Some(&SqlState::QUERY_CANCELED)));
        assert!(!is_lock_not_available(None));
    }

    #[test]
    fn test_timeout_is_not_detected_from_message_text() {
        let fake = FakeExecutor::new();
        fake.fail_with(
            "pg_advisory_lock(",
            "canceling statement due to lock timeout",
        );

        let err = MigrationLockGuard::acquire(&fake, 1).err().unwrap();

        assert!(matches!(err, MigrationError::Database(_)));
        assert_eq!(fake.count("RESET lock_timeout"), 1);
        assert_eq!(fake.count("SELECT pg_advisory_unlock("), 0);
    }
}
