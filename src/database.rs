//! Lifecycle controller
//!
//! [`Database`] owns the `init` / `migrate` / `close` state machine:
//!
//! ```text
//! Uninitialized --init--> Connected --migrate--> Migrated
//!       |                     |                      |
//!       +--------close--------+---------close--------+--> Closed --init--> Connected
//! ```
//!
//! `init` opens the single session, registers it for shared lookup, applies
//! the schema for engines that use one, and starts the liveness monitor.
//! Lifecycle calls are serialised; the monitor runs beside them.

use crate::config::DatabaseConfig;
use crate::connection::{
    redact_url, ConnectionError, ConnectionHandle, ConnectionOptions, Connector, PostgresConnector,
};
use crate::executor::LifeError;
use crate::migration::{Migration, MigrationError, MigrationLedger, Migrator, StateTable};
use crate::monitor::{LivenessMonitor, MonitorHandle};
use crate::registry::ConnectionRegistry;
use crate::reporter::{ErrorReporter, LogReporter};
use crate::schema::{SchemaConfigurator, SchemaSetup};
use crate::state::{ConnectionState, LifecycleState, SharedState};
use crate::transaction::{run_in_transaction, Transaction, TransactionError};
use may::sync::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;

/// Lifecycle error type
#[derive(Debug)]
pub enum LifecycleError {
    /// The session could not be opened
    Connection(ConnectionError),
    /// A migration unit or the migration bookkeeping failed
    Migration(MigrationError),
    /// The operation needs a successful `init()` first
    NotInitialized,
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::Connection(e) => write!(f, "Database connection failed: {e}"),
            LifecycleError::Migration(e) => write!(f, "Database migration failed: {e}"),
            LifecycleError::NotInitialized => {
                write!(f, "Database has not been initialized, call init() first")
            }
        }
    }
}

impl std::error::Error for LifecycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LifecycleError::Connection(e) => Some(e),
            LifecycleError::Migration(e) => Some(e),
            LifecycleError::NotInitialized => None,
        }
    }
}

impl From<ConnectionError> for LifecycleError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::NotInitialized | ConnectionError::Closed => {
                LifecycleError::NotInitialized
            }
            other => LifecycleError::Connection(other),
        }
    }
}

impl From<MigrationError> for LifecycleError {
    fn from(err: MigrationError) -> Self {
        LifecycleError::Migration(err)
    }
}

#[derive(Default)]
struct Lifecycle {
    handle: Option<Arc<ConnectionHandle>>,
    monitor: Option<MonitorHandle>,
    schema: Option<SchemaSetup>,
}

/// Builder for [`Database`]; every collaborator has a production default.
pub struct DatabaseBuilder {
    config: DatabaseConfig,
    migrations: Vec<Arc<dyn Migration>>,
    connector: Arc<dyn Connector>,
    reporter: Arc<dyn ErrorReporter>,
    registry: Arc<ConnectionRegistry>,
    ledger: Option<Arc<dyn MigrationLedger>>,
}

impl DatabaseBuilder {
    /// Appends one migration unit; units run in the order they are added.
    #[must_use]
    pub fn migration(mut self, migration: impl Migration + 'static) -> Self {
        self.migrations.push(Arc::new(migration));
        self
    }

    #[must_use]
    pub fn migrations(mut self, migrations: impl IntoIterator<Item = Arc<dyn Migration>>) -> Self {
        self.migrations.extend(migrations);
        self
    }

    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Sink for liveness probe failures (default: [`LogReporter`]).
    #[must_use]
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Registry the handle is published in (default: the process-wide one).
    #[must_use]
    pub fn registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Migration ledger (default: the `<prefix>migrations` table).
    #[must_use]
    pub fn ledger(mut self, ledger: Arc<dyn MigrationLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn build(self) -> Database {
        Database {
            config: self.config,
            migrations: self.migrations,
            connector: self.connector,
            reporter: self.reporter,
            registry: self.registry,
            ledger: self.ledger,
            state: Arc::new(SharedState::new()),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }
}

/// The process-wide connection lifecycle controller.
///
/// # Examples
///
/// ```no_run
/// use lifebuoy::{Database, DatabaseConfig, LifeExecutor};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let db = Database::new(DatabaseConfig::load()?);
/// db.init()?;
/// db.migrate()?;
///
/// db.transaction(|tx| -> Result<(), lifebuoy::LifeError> {
///     tx.execute("UPDATE accounts SET balance = balance - 10 WHERE id = $1", &[&1i32])?;
///     tx.execute("UPDATE accounts SET balance = balance + 10 WHERE id = $1", &[&2i32])?;
///     Ok(())
/// })?;
///
/// db.close();
/// # Ok(())
/// # }
/// ```
pub struct Database {
    config: DatabaseConfig,
    migrations: Vec<Arc<dyn Migration>>,
    connector: Arc<dyn Connector>,
    reporter: Arc<dyn ErrorReporter>,
    registry: Arc<ConnectionRegistry>,
    ledger: Option<Arc<dyn MigrationLedger>>,
    state: Arc<SharedState>,
    lifecycle: Mutex<Lifecycle>,
}

impl Database {
    /// A controller with the production collaborators and no migrations.
    pub fn new(config: DatabaseConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: DatabaseConfig) -> DatabaseBuilder {
        DatabaseBuilder {
            config,
            migrations: Vec::new(),
            connector: Arc::new(PostgresConnector),
            reporter: Arc::new(LogReporter),
            registry: ConnectionRegistry::global(),
            ledger: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Opens the shared session. A no-op while a connection is open.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::Connection` if the session cannot be opened;
    /// nothing is registered and the state is left as it was.
    pub fn init(&self) -> Result<(), LifecycleError> {
        let mut lifecycle = self.lock();
        if self.state.lifecycle().is_open() {
            log::debug!("init() called on an open connection, ignoring");
            return Ok(());
        }

        let options = ConnectionOptions::from_config(&self.config, self.migrations.clone());
        log::info!(
            "Connecting to {} database '{}' at {}",
            options.db_type,
            options.database,
            redact_url(&options.url)
        );

        let executor = self.connector.connect(&options)?;
        let handle = Arc::new(ConnectionHandle::new(executor, options));
        if self.registry.register(Arc::clone(&handle)).is_some() {
            log::warn!("Replaced a connection handle registered by another controller");
        }

        if handle.options().db_type.uses_schemas() {
            let configurator = SchemaConfigurator::from_options(handle.options());
            let setup = handle
                .session()
                .map_err(LifeError::from)
                .and_then(|session| configurator.configure(&session));
            match setup {
                Ok(setup) => lifecycle.schema = Some(setup),
                Err(e) => log::warn!("Schema configuration failed, continuing without it: {e}"),
            }
        }

        let epoch = self.state.mark_connected();
        lifecycle.handle = Some(Arc::clone(&handle));

        if self.config.liveness.enabled {
            let monitor = LivenessMonitor::new(
                handle,
                Arc::clone(&self.state),
                Arc::clone(&self.reporter),
                self.config.liveness.interval(),
                epoch,
            );
            match monitor.spawn() {
                Ok(monitor) => lifecycle.monitor = Some(monitor),
                Err(e) => log::warn!("Could not start liveness monitor: {e}"),
            }
        }

        log::info!("Database connection initialized");
        Ok(())
    }

    /// Applies every pending migration unit, each in its own transaction by default.
    ///
    /// Holds the session for the whole run, so liveness probes are skipped meanwhile.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::NotInitialized` before `init()`, and
    /// `LifecycleError::Migration` if a unit fails; `migrated` stays false.
    pub fn migrate(&self) -> Result<Vec<String>, LifecycleError> {
        let lifecycle = self.lock();
        let handle = self.open_handle(&lifecycle)?;

        let migrator = self.migrator(handle.options());
        let session = handle.session()?;
        let applied = migrator.run(&session)?;
        drop(session);

        self.state.mark_migrated();
        log::info!("Migrations complete ({} applied)", applied.len());
        Ok(applied)
    }

    /// Names of configured units not applied yet.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::NotInitialized` before `init()`.
    pub fn pending_migrations(&self) -> Result<Vec<String>, LifecycleError> {
        let lifecycle = self.lock();
        let handle = self.open_handle(&lifecycle)?;

        let session = handle.session()?;
        Ok(self.migrator(handle.options()).pending(&session)?)
    }

    /// Reverts the most recently applied migration unit and returns its name.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::NotInitialized` before `init()`, and
    /// `LifecycleError::Migration` if there is nothing to revert or `down()` fails.
    pub fn revert_last_migration(&self) -> Result<String, LifecycleError> {
        let lifecycle = self.lock();
        let handle = self.open_handle(&lifecycle)?;

        let session = handle.session()?;
        let reverted = self.migrator(handle.options()).undo_last(&session)?;
        log::info!("Reverted migration {reverted}");
        Ok(reverted)
    }

    /// Stops the monitor and destroys the session. Safe to call at any time, any number of times.
    pub fn close(&self) {
        let mut lifecycle = self.lock();

        self.state.mark_closed();

        if let Some(monitor) = lifecycle.monitor.take() {
            monitor.join();
        }

        match lifecycle.handle.take() {
            Some(handle) => {
                if handle.is_initialized() {
                    handle.destroy();
                }
                self.registry.unregister(&handle);
                log::info!("Database connection closed");
            }
            None => log::debug!("close() called without an open connection"),
        }
        lifecycle.schema = None;
    }

    /// The registered connection handle.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::NotInitialized` before `init()` completes.
    pub fn connection(&self) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        self.registry.get()
    }

    /// Runs `work` in a transaction: commit on `Ok`, rollback on `Err`.
    ///
    /// The work's error is returned unchanged. Scopes share the single
    /// session, so concurrent callers run one after another.
    ///
    /// # Errors
    ///
    /// Returns the work's error, or a `TransactionError` converted into `E`
    /// when there is no connection or `BEGIN`/`COMMIT` fails.
    pub fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<TransactionError>,
    {
        let handle = self.connection().map_err(TransactionError::from)?;
        let session = handle.session().map_err(TransactionError::from)?;
        run_in_transaction(&session, work)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.snapshot()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.state.lifecycle()
    }

    /// Where the search path was applied by the last `init()`, if anywhere.
    pub fn schema_setup(&self) -> Option<SchemaSetup> {
        self.lock().schema.clone()
    }

    fn open_handle(&self, lifecycle: &Lifecycle) -> Result<Arc<ConnectionHandle>, LifecycleError> {
        if !self.state.lifecycle().is_open() {
            return Err(LifecycleError::NotInitialized);
        }
        lifecycle
            .handle
            .clone()
            .ok_or(LifecycleError::NotInitialized)
    }

    fn migrator(&self, options: &ConnectionOptions) -> Migrator {
        let ledger = self
            .ledger
            .clone()
            .unwrap_or_else(|| Arc::new(StateTable::new(&options.table_prefix)));
        Migrator::new(options, &self.config.migrations, ledger)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}
