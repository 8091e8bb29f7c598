//! Connection registry: logical key → live connections.
//!
//! Owned by the hub and only ever touched behind the hub's lock. A key is
//! present iff it has at least one connection.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::client::Client;

/// Connections grouped by logical key, in registration order.
#[derive(Debug, Default)]
pub struct Registry {
    clients: HashMap<String, Vec<Arc<Client>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection under its key. Returns the key's connection count
    /// including the new one.
    pub fn insert(&mut self, client: Arc<Client>) -> usize {
        let entry = self.clients.entry(client.key().to_string()).or_default();
        entry.push(client);
        entry.len()
    }

    /// Remove one connection. Drops the key once its last connection goes.
    pub fn remove(&mut self, key: &str, id: Uuid) -> Option<Arc<Client>> {
        let conns = self.clients.get_mut(key)?;
        let pos = conns.iter().position(|c| c.id() == id)?;
        let removed = conns.remove(pos);
        if conns.is_empty() {
            self.clients.remove(key);
        }
        Some(removed)
    }

    /// Look up one connection by key and id.
    pub fn find(&self, key: &str, id: Uuid) -> Option<Arc<Client>> {
        self.clients
            .get(key)?
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    /// All connections of a key. Empty for unknown keys.
    pub fn connections(&self, key: &str) -> &[Arc<Client>] {
        self.clients.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the key has any live connection.
    pub fn contains_key(&self, key: &str) -> bool {
        self.clients.contains_key(key)
    }

    /// Every registered connection.
    pub fn all(&self) -> Vec<Arc<Client>> {
        self.clients.values().flatten().cloned().collect()
    }

    /// Empty the registry, returning what was in it.
    pub fn drain(&mut self) -> Vec<Arc<Client>> {
        self.clients.drain().flat_map(|(_, v)| v).collect()
    }

    pub fn key_count(&self) -> usize {
        self.clients.len()
    }

    /// Total number of connections across all keys.
    pub fn len(&self) -> usize {
        self.clients.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
