//! # Lifebuoy
//!
//! Process-wide PostgreSQL connection lifecycle manager for the `may` runtime.
//!
//! One [`Database`] controller owns the single shared session:
//! - `init()` connects, registers the handle for [`get_connection`], applies the
//!   configured schema and starts a background liveness probe
//! - `migrate()` applies the configured [`migration::Migration`] units, each
//!   wrapped with instrumentation and run in its own transaction
//! - `transaction(work)` commits on `Ok` and rolls back on `Err`
//! - `close()` stops the probe and destroys the session
//!
//! Everything is synchronous and safe to call from a coroutine.

pub mod config;
pub mod connection;
pub mod database;
pub mod executor;
pub mod metrics;
pub mod migration;
pub mod monitor;
pub mod registry;
pub mod reporter;
pub mod schema;
pub mod state;
pub mod transaction;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::{DatabaseConfig, DbType, LivenessConfig, MigrationConfig, TransactionMode};
pub use connection::{
    connect, ConnectionError, ConnectionHandle, ConnectionOptions, Connector, PostgresConnector,
    Session,
};
pub use database::{Database, DatabaseBuilder, LifecycleError};
pub use executor::{LifeError, LifeExecutor, MayPostgresExecutor};
pub use monitor::ProbeOutcome;
pub use registry::{get_connection, ConnectionRegistry};
pub use reporter::{ChannelReporter, ErrorReporter, LogReporter};
pub use schema::{SearchPathScope, SchemaSetup};
pub use state::{ConnectionState, LifecycleState};
pub use transaction::{Transaction, TransactionError};
