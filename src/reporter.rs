//! Error-reporting collaborator for failures that must not stop the caller.

use crossbeam_channel::{Sender, TrySendError};
use std::error::Error;

/// Fire-and-forget error sink.
///
/// Implementations must return promptly and must not panic; the liveness
/// monitor calls this from its coroutine and carries on regardless.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &dyn Error);
}

/// Default reporter: writes the error through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, error: &dyn Error) {
        log::error!("Database liveness probe failed: {error}");
    }
}

/// Forwards error messages into a bounded channel, dropping them when full.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: Sender<String>,
}

impl ChannelReporter {
    pub fn new(tx: Sender<String>) -> Self {
        Self { tx }
    }
}

impl ErrorReporter for ChannelReporter {
    fn report(&self, error: &dyn Error) {
        match self.tx.try_send(error.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                log::debug!("Error report channel full, dropping: {message}");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LifeError;
    use crossbeam_channel::bounded;

    #[test]
    fn test_channel_reporter_forwards_message() {
        let (tx, rx) = bounded(4);
        let reporter = ChannelReporter::new(tx);
        reporter.report(&LifeError::QueryError("boom".to_string()));

        assert_eq!(rx.try_recv().unwrap(), "Query error: boom");
    }

    #[test]
    fn test_channel_reporter_never_blocks_when_full_or_closed() {
        let (tx, rx) = bounded(1);
        let reporter = ChannelReporter::new(tx);
        reporter.report(&LifeError::ConnectionClosed);
        reporter.report(&LifeError::ConnectionClosed);
        assert_eq!(rx.len(), 1);

        drop(rx);
        reporter.report(&LifeError::ConnectionClosed);
    }
}
