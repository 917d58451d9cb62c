//! Connection accounting.
//!
//! A caller-owned registry of live connections, disabled by default. Pass it
//! to [`Connection::new`](crate::connection::Connection::new) to have
//! connections add themselves on connect and remove themselves when they are
//! destroyed or fail.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

/// Identity of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub host: String,
    pub port: u16,
}

/// Registry of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    enabled: AtomicBool,
    connections: DashMap<u64, ConnectionInfo>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the registry and starts recording.
    pub fn enable(&self) {
        self.connections.clear();
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Stops recording. Existing entries are kept.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn add(&self, info: ConnectionInfo) {
        if self.is_enabled() {
            self.connections.insert(info.id, info);
        }
    }

    pub(crate) fn remove(&self, id: u64) {
        if self.is_enabled() {
            self.connections.remove(&id);
        }
    }

    /// Snapshot of the registered connections, ordered by id.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut out: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by_key(|info| info.id);
        out
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: u64) -> ConnectionInfo {
        ConnectionInfo {
            id,
            host: "localhost".to_string(),
            port: 27017,
        }
    }

    #[test]
    fn test_disabled_by_default() {
        let registry = ConnectionRegistry::new();
        registry.add(info(1));
        assert!(!registry.is_enabled());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_enable_add_remove() {
        let registry = ConnectionRegistry::new();
        registry.enable();
        registry.add(info(2));
        registry.add(info(1));
        assert_eq!(
            registry.connections().iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![1, 2]
        );

        registry.remove(1);
        assert_eq!(registry.len(), 1);

        registry.disable();
        registry.remove(2);
        assert_eq!(registry.len(), 1);

        registry.enable();
        assert!(registry.is_empty());
    }
}
