//! Migration-specific error types

use crate::connection::ConnectionError;
use crate::executor::LifeError;
use crate::transaction::TransactionError;

/// Migration-specific errors
#[derive(Debug)]
pub enum MigrationError {
    /// Ledger or lock statement failed
    Database(LifeError),
    /// No session to run migrations on
    Connection(ConnectionError),
    /// Opening or finishing a migration transaction failed
    Transaction(TransactionError),
    /// Two configured units share a name
    DuplicateMigration(String),
    /// Migration lock timeout
    LockTimeout(String),
    /// Migration failed during execution
    ExecutionFailed {
        timestamp: i64,
        name: String,
        error: LifeError,
    },
    /// `revert` found nothing applied
    NothingToRevert,
    /// The last applied migration is not in the configured list
    UnknownMigration(String),
    /// A unit opted out of transactions while `TransactionMode::All` is configured
    TransactionModeConflict(String),
}

impl std::fmt::Display for MigrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationError::Database(e) => write!(f, "Database error: {e}"),
            MigrationError::Connection(e) => write!(f, "Connection error: {e}"),
            MigrationError::Transaction(e) => write!(f, "Transaction error: {e}"),
            MigrationError::DuplicateMigration(name) => {
                write!(f, "Migration '{name}' is configured more than once")
            }
            MigrationError::LockTimeout(msg) => {
                write!(
                    f,
                    "Migration lock timeout: {msg}\n\
                     Another process may be running migrations."
                )
            }
            MigrationError::ExecutionFailed {
                timestamp,
                name,
                error,
            } => {
                write!(
                    f,
                    "Migration '{name}' (timestamp {timestamp}) failed during execution: {error}"
                )
            }
            MigrationError::NothingToRevert => write!(f, "No applied migration to revert"),
            MigrationError::UnknownMigration(name) => {
                write!(
                    f,
                    "Applied migration '{name}' is not in the configured migration list"
                )
            }
            MigrationError::TransactionModeConflict(name) => {
                write!(
                    f,
                    "Migration '{name}' cannot run outside a transaction when transaction_mode is 'all'"
                )
            }
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::Database(e) => Some(e),
            MigrationError::Connection(e) => Some(e),
            MigrationError::Transaction(e) => Some(e),
            MigrationError::ExecutionFailed { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<LifeError> for MigrationError {
    fn from(error: LifeError) -> Self {
        MigrationError::Database(error)
    }
}

impl From<ConnectionError> for MigrationError {
    fn from(error: ConnectionError) -> Self {
        MigrationError::Connection(error)
    }
}

impl From<TransactionError> for MigrationError {
    fn from(error: TransactionError) -> Self {
        MigrationError::Transaction(error)
    }
}
