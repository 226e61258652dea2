//! Migration system
//!
//! This module provides:
//! - The [`Migration`] trait implemented by application-supplied units
//! - The instrumentation decorator applied to every unit before it runs
//! - The `<prefix>migrations` ledger and the advisory migration lock
//! - [`Migrator`], which applies pending units under the configured [`TransactionMode`]
//!
//! # Example
//!
//! ```rust,no_run
//! use lifebuoy::migration::{Migration, MigrationContext};
//! use lifebuoy::{LifeError, LifeExecutor};
//!
//! pub struct CreateUsers1700000000000;
//!
//! impl Migration for CreateUsers1700000000000 {
//!     fn name(&self) -> &str {
//!         "CreateUsers1700000000000"
//!     }
//!
//!     fn timestamp(&self) -> i64 {
//!         1_700_000_000_000
//!     }
//!
//!     fn up(&self, ctx: &MigrationContext<'_>) -> Result<(), LifeError> {
//!         let users = ctx.escape_table("users");
//!         ctx.execute(&format!("CREATE TABLE {users} (id SERIAL PRIMARY KEY, email TEXT NOT NULL)"), &[])?;
//!         Ok(())
//!     }
//!
//!     fn down(&self, ctx: &MigrationContext<'_>) -> Result<(), LifeError> {
//!         ctx.execute(&format!("DROP TABLE {}", ctx.escape_table("users")), &[])?;
//!         Ok(())
//!     }
//! }
//! ```
//!
//! [`TransactionMode`]: crate::config::TransactionMode

pub mod error;
pub mod instrument;
pub mod lock;
pub mod migration;
pub mod migrator;
pub mod record;
pub mod state_table;

pub use error::MigrationError;
pub use instrument::{instrument, wrap_migrations, InstrumentedMigration};
pub use lock::{MigrationLockGuard, MIGRATION_LOCK_KEY};
pub use migration::{Migration, MigrationContext};
pub use migrator::Migrator;
pub use record::MigrationRecord;
pub use state_table::{MigrationLedger, StateTable};
