//! Fakes for exercising the lifecycle without a database.
//!
//! Compiled for this crate's unit tests and, with the `test-helpers` feature,
//! for downstream test suites.

use crate::connection::{ConnectionError, ConnectionOptions, Connector};
use crate::executor::{LifeError, LifeExecutor};
use crate::migration::{Migration, MigrationContext, MigrationLedger, MigrationRecord};
use may_postgres::types::ToSql;
use may_postgres::Row;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::thread;
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

thread_local! {
    static CAPTURED: RefCell<Option<Vec<(Level, String)>>> = const { RefCell::new(None) };
}

struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        CAPTURED.with(|captured| {
            if let Some(lines) = captured.borrow_mut().as_mut() {
                lines.push((record.level(), record.args().to_string()));
            }
        });
    }

    fn flush(&self) {}
}

static CAPTURE_LOGGER: CaptureLogger = CaptureLogger;

/// Runs `block` and returns what it logged on the current thread.
///
/// Installs a process-wide `log` logger on first use; fails silently if
/// another logger is already installed.
pub fn capture_logs<T>(block: impl FnOnce() -> T) -> (T, Vec<(Level, String)>) {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if log::set_logger(&CAPTURE_LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Trace);
        }
    });

    CAPTURED.with(|captured| *captured.borrow_mut() = Some(Vec::new()));
    let result = block();
    let lines = CAPTURED.with(|captured| captured.borrow_mut().take().unwrap_or_default());
    (result, lines)
}

struct Failure {
    pattern: String,
    message: String,
    once: bool,
    anchored: bool,
}

impl Failure {
    fn matches(&self, query: &str) -> bool {
        if self.anchored {
            query.trim_start().starts_with(&self.pattern)
        } else {
            query.contains(&self.pattern)
        }
    }
}

#[derive(Default)]
struct FakeState {
    statements: Vec<String>,
    committed: Vec<String>,
    open_transaction: Option<Vec<String>>,
    failures: Vec<Failure>,
}

/// In-memory executor that records statements.
///
/// Writes issued between `BEGIN` and `COMMIT` only reach [`FakeExecutor::committed`]
/// on commit; `ROLLBACK` discards them. Clones share state.
#[derive(Clone, Default)]
pub struct FakeExecutor {
    state: Arc<Mutex<FakeState>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every statement containing `pattern` fails until [`FakeExecutor::clear_failures`].
    pub fn fail_on(&self, pattern: &str) {
        self.fail_with(pattern, "injected failure");
    }

    pub fn fail_with(&self, pattern: &str, message: &str) {
        self.push_failure(pattern, message, false, false);
    }

    /// Only the next statement containing `pattern` fails.
    pub fn fail_once(&self, pattern: &str) {
        self.push_failure(pattern, "injected failure", true, false);
    }

    /// Every statement that starts with `prefix` fails.
    pub fn fail_starting_with(&self, prefix: &str) {
        self.push_failure(prefix, "injected failure", false, true);
    }

    fn push_failure(&self, pattern: &str, message: &str, once: bool, anchored: bool) {
        lock(&self.state).failures.push(Failure {
            pattern: pattern.to_string(),
            message: message.to_string(),
            once,
            anchored,
        });
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    /// Every statement attempted, in order, including failed ones.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.state).statements.clone()
    }

    /// Statements whose effects are durable.
    pub fn committed(&self) -> Vec<String> {
        lock(&self.state).committed.clone()
    }

    /// Number of attempted statements starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.state)
            .statements
            .iter()
            .filter(|s| s.trim_start().starts_with(prefix))
            .count()
    }

    fn attempt(&self, query: &str) -> Result<(), LifeError> {
        let mut state = lock(&self.state);
        state.statements.push(query.to_string());

        if let Some(idx) = state.failures.iter().position(|f| f.matches(query)) {
            let message = if state.failures[idx].once {
                state.failures.remove(idx).message
            } else {
                state.failures[idx].message.clone()
            };
            return Err(LifeError::QueryError(format!("{message} ({query})")));
        }

        match query.trim() {
            "BEGIN" => state.open_transaction = Some(Vec::new()),
            "COMMIT" => {
                let pending = state.open_transaction.take().unwrap_or_default();
                state.committed.extend(pending);
            }
            "ROLLBACK" => state.open_transaction = None,
            statement => match state.open_transaction.as_mut() {
                Some(pending) => pending.push(statement.to_string()),
                None => state.committed.push(statement.to_string()),
            },
        }
        Ok(())
    }
}

impl LifeExecutor for FakeExecutor {
    fn execute(&self, query: &str, _params: &[&dyn ToSql]) -> Result<u64, LifeError> {
        self.attempt(query)?;
        Ok(1)
    }

    fn query_one(&self, query: &str, _params: &[&dyn ToSql]) -> Result<Row, LifeError> {
        self.attempt(query)?;
        Err(LifeError::QueryError("FakeExecutor cannot produce rows".to_string()))
    }

    fn query_all(&self, query: &str, _params: &[&dyn ToSql]) -> Result<Vec<Row>, LifeError> {
        self.attempt(query)?;
        Err(LifeError::QueryError("FakeExecutor cannot produce rows".to_string()))
    }
}

/// Connector handing out clones of one [`FakeExecutor`].
#[derive(Default)]
pub struct FakeConnector {
    executor: FakeExecutor,
    connects: AtomicUsize,
    failing: AtomicBool,
}

impl FakeConnector {
    pub fn new(executor: FakeExecutor) -> Self {
        Self {
            executor,
            connects: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn executor(&self) -> &FakeExecutor {
        &self.executor
    }

    /// Sessions opened so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        _options: &ConnectionOptions,
    ) -> Result<Box<dyn LifeExecutor + Send + Sync>, ConnectionError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectionError::Other("connection refused".to_string()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.executor.clone()))
    }
}

const LEDGER_INSERT: &str = "INSERT INTO memory_migrations VALUES ('";
const LEDGER_DELETE: &str = "DELETE FROM memory_migrations WHERE name = '";

/// Ledger whose rows live in a [`FakeExecutor`]'s committed statements, so
/// records follow the same commit and rollback rules as the units.
pub struct MemoryLedger {
    source: FakeExecutor,
    records: Mutex<HashMap<String, MigrationRecord>>,
}

impl MemoryLedger {
    pub fn new(source: FakeExecutor) -> Self {
        Self {
            source,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Committed migration names, oldest first.
    pub fn applied_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for statement in self.source.committed() {
            if let Some(name) = statement
                .strip_prefix(LEDGER_INSERT)
                .and_then(|rest| rest.strip_suffix("')"))
            {
                names.push(name.to_string());
            } else if let Some(name) = statement
                .strip_prefix(LEDGER_DELETE)
                .and_then(|rest| rest.strip_suffix('\''))
            {
                names.retain(|n| n != name);
            }
        }
        names
    }
}

impl MigrationLedger for MemoryLedger {
    fn ensure(&self, executor: &dyn LifeExecutor) -> Result<(), LifeError> {
        executor.execute("CREATE TABLE IF NOT EXISTS memory_migrations", &[])?;
        Ok(())
    }

    fn applied(&self, _executor: &dyn LifeExecutor) -> Result<Vec<MigrationRecord>, LifeError> {
        let records = lock(&self.records);
        Ok(self
            .applied_names()
            .into_iter()
            .map(|name| {
                records
                    .get(&name)
                    .cloned()
                    .unwrap_or_else(|| MigrationRecord::new(0, name, None))
            })
            .collect())
    }

    fn record(&self, executor: &dyn LifeExecutor, record: &MigrationRecord) -> Result<(), LifeError> {
        executor.execute(&format!("{LEDGER_INSERT}{}')", record.name), &[])?;
        lock(&self.records).insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, executor: &dyn LifeExecutor, name: &str) -> Result<(), LifeError> {
        executor.execute(&format!("{LEDGER_DELETE}{name}'"), &[])?;
        Ok(())
    }
}

/// Migration unit that creates (and drops) a table named after itself.
pub struct RecordingMigration {
    name: String,
    timestamp: i64,
    transactional: bool,
    failing: AtomicBool,
    up_calls: AtomicUsize,
    down_calls: AtomicUsize,
}

impl RecordingMigration {
    pub fn new(name: impl Into<String>, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            timestamp,
            transactional: true,
            failing: AtomicBool::new(false),
            up_calls: AtomicUsize::new(0),
            down_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }

    /// `up()` creates its table, then fails.
    #[must_use]
    pub fn failing(self) -> Self {
        self.set_failing(true);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn up_calls(&self) -> usize {
        self.up_calls.load(Ordering::SeqCst)
    }

    pub fn down_calls(&self) -> usize {
        self.down_calls.load(Ordering::SeqCst)
    }

    fn table(&self, ctx: &MigrationContext<'_>) -> String {
        ctx.escape_table(&self.name.to_lowercase())
    }
}

impl Migration for RecordingMigration {
    fn name(&self) -> &str {
        &self.name
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn up(&self, ctx: &MigrationContext<'_>) -> Result<(), LifeError> {
        self.up_calls.fetch_add(1, Ordering::SeqCst);
        ctx.execute(&format!("CREATE TABLE {} (id INT)", self.table(ctx)), &[])?;
        if self.failing.load(Ordering::SeqCst) {
            return Err(LifeError::QueryError(format!("{} failed", self.name)));
        }
        Ok(())
    }

    fn down(&self, ctx: &MigrationContext<'_>) -> Result<(), LifeError> {
        self.down_calls.fetch_add(1, Ordering::SeqCst);
        ctx.execute(&format!("DROP TABLE {}", self.table(ctx)), &[])?;
        Ok(())
    }

    fn transaction(&self) -> bool {
        self.transactional
    }
}
