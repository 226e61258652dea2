//! Shared-access registry for the connection handle.
//!
//! The lifecycle controller registers the handle it opened here; everything
//! else looks it up. Tests build their own [`ConnectionRegistry`] so they
//! never touch the process-wide one.

use crate::connection::{ConnectionError, ConnectionHandle};
use once_cell::sync::Lazy;
use std::sync::{Arc, RwLock};

static GLOBAL_REGISTRY: Lazy<Arc<ConnectionRegistry>> =
    Lazy::new(|| Arc::new(ConnectionRegistry::new()));

/// Holds at most one registered [`ConnectionHandle`].
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    slot: RwLock<Option<Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by [`get_connection`].
    pub fn global() -> Arc<ConnectionRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Registers `handle`, returning the one it replaced.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        let mut slot = self.slot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.replace(handle)
    }

    /// # Errors
    ///
    /// Returns `ConnectionError::NotInitialized` when nothing is registered.
    pub fn get(&self) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        let slot = self.slot.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.clone().ok_or(ConnectionError::NotInitialized)
    }

    pub fn is_registered(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Removes `handle` if it is the registered one. A newer handle registered
    /// by someone else is left in place.
    pub fn unregister(&self, handle: &Arc<ConnectionHandle>) -> bool {
        let mut slot = self.slot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, handle) => {
                slot.take();
                true
            }
            _ => false,
        }
    }
}

/// Returns the handle registered in the process-wide registry.
///
/// # Errors
///
/// Returns `ConnectionError::NotInitialized` if called before `init()` completes.
pub fn get_connection() -> Result<Arc<ConnectionHandle>, ConnectionError> {
    GLOBAL_REGISTRY.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::connection::ConnectionOptions;
    use crate::test_helpers::FakeExecutor;

    fn handle() -> Arc<ConnectionHandle> {
        let options = ConnectionOptions::from_config(&DatabaseConfig::default(), Vec::new());
        Arc::new(ConnectionHandle::new(Box::new(FakeExecutor::new()), options))
    }

    #[test]
    fn test_get_before_register_fails() {
        let registry = ConnectionRegistry::new();
        assert!(matches!(registry.get(), Err(ConnectionError::NotInitialized)));
        assert!(!registry.is_registered());
    }

    #[test]
    fn test_register_and_get_share_the_handle() {
        let registry = ConnectionRegistry::new();
        let h = handle();
        assert!(registry.register(Arc::clone(&h)).is_none());

        let found = registry.get().unwrap();
        assert!(Arc::ptr_eq(&found, &h));
    }

    #[test]
    fn test_unregister_only_removes_matching_handle() {
        let registry = ConnectionRegistry::new();
        let old = handle();
        let new = handle();
        registry.register(Arc::clone(&old));
        registry.register(Arc::clone(&new));

        assert!(!registry.unregister(&old));
        assert!(registry.is_registered());
        assert!(registry.unregister(&new));
        assert!(!registry.is_registered());
    }
}
