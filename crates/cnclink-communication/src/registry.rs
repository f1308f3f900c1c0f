//! Process-wide controller registry.
//!
//! Maps each serial port to its live controller handle. Passed explicitly
//! into whoever opens controllers, never held as an ambient global, so the
//! core stays testable.

use crate::service::ControllerHandle;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared port → controller map.
#[derive(Debug, Clone, Default)]
pub struct ControllerRegistry {
    inner: Arc<RwLock<HashMap<String, ControllerHandle>>>,
}

impl ControllerRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller for its port. Re-opening a port without a prior
    /// clean close is an anomaly: the new controller supersedes and the event
    /// is logged.
    pub fn register(&self, handle: ControllerHandle) {
        let port = handle.port().to_string();
        let mut map = self.inner.write();
        if map.insert(port.clone(), handle).is_some() {
            tracing::warn!("Superseding existing controller on {}", port);
        }
    }

    /// Remove the controller for a port, returning it if present
    pub fn unregister(&self, port: &str) -> Option<ControllerHandle> {
        self.inner.write().remove(port)
    }

    /// Look up the controller for a port
    pub fn get(&self, port: &str) -> Option<ControllerHandle> {
        self.inner.read().get(port).cloned()
    }

    /// Ports with live controllers
    pub fn ports(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Number of live controllers
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether no controllers are registered
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
