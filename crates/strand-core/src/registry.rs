//! Client-group registry: the only process-wide shared mutable state.
//!
//! Two sharded maps track live connections and group membership. Fan-out
//! works on snapshots so slow writes never hold registry locks; lookups by
//! id happen at delivery time, so a member that died between snapshot and
//! write is simply skipped.

use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tracing::debug;

use crate::connection::ConnectionHandle;

/// Maximum group name length in bytes.
pub const MAX_GROUP_NAME_LENGTH: usize = 256;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Invalid group name.
    #[error("invalid group name: {0}")]
    InvalidGroup(&'static str),
}

/// Validate a group name.
///
/// # Errors
///
/// Returns a message naming the violated constraint.
pub fn validate_group_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("group name cannot be empty");
    }
    if name.len() > MAX_GROUP_NAME_LENGTH {
        return Err("group name too long");
    }
    if name.chars().any(|c| c.is_control()) {
        return Err("group name contains control characters");
    }
    Ok(())
}

/// Live connections and their group memberships.
///
/// Groups hold connection ids, never handles, so a group can never keep a
/// dead connection alive. Groups are created lazily on first add and
/// removed when their last member leaves.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    connections: DashMap<String, ConnectionHandle>,
    groups: DashMap<String, DashSet<String>>,
}

impl ClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live connection.
    pub fn add(&self, handle: ConnectionHandle) {
        debug!(connection = %handle.id(), "registering connection");
        self.connections.insert(handle.id().to_owned(), handle);
    }

    /// Remove a connection and strip it from every group it was in.
    pub fn remove(&self, connection_id: &str) {
        self.connections.remove(connection_id);

        let mut emptied = Vec::new();
        for entry in self.groups.iter() {
            entry.value().remove(connection_id);
            if entry.value().is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for group in emptied {
            // Re-check under the entry lock; a concurrent add wins.
            self.groups
                .remove_if(&group, |_, members| members.is_empty());
        }

        debug!(connection = %connection_id, "connection removed from registry");
    }

    /// Look up a live connection.
    #[must_use]
    pub fn get(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
    }

    /// Whether a connection is currently registered.
    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Add a connection to a group, creating the group on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the group name is invalid.
    pub fn add_to_group(&self, group: &str, connection_id: &str) -> Result<(), RegistryError> {
        validate_group_name(group).map_err(RegistryError::InvalidGroup)?;
        let members = self.groups.entry(group.to_owned()).or_default();
        members.insert(connection_id.to_owned());
        debug!(group = %group, connection = %connection_id, members = members.len(), "added to group");
        Ok(())
    }

    /// Remove a connection from a group, dropping the group when empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the group name is invalid.
    pub fn remove_from_group(&self, group: &str, connection_id: &str) -> Result<(), RegistryError> {
        validate_group_name(group).map_err(RegistryError::InvalidGroup)?;
        if let Some(members) = self.groups.get(group) {
            members.remove(connection_id);
            if members.is_empty() {
                drop(members);
                self.groups.remove_if(group, |_, members| members.is_empty());
                debug!(group = %group, "dropped empty group");
            }
        }
        Ok(())
    }

    /// Snapshot of a group's member ids.
    #[must_use]
    pub fn group_members(&self, group: &str) -> Vec<String> {
        self.groups
            .get(group)
            .map(|members| members.iter().map(|id| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of every live connection id.
    #[must_use]
    pub fn all_ids(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Whether the named group currently exists.
    #[must_use]
    pub fn group_exists(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;
    use crate::options::OverflowPolicy;
    use tokio::sync::mpsc;

    fn handle(id: &str) -> ConnectionHandle {
        let (tx, _rx) = mpsc::channel(8);
        ConnectionHandle::new(id, tx, OverflowPolicy::Block)
    }

    #[test]
    fn test_group_name_validation() {
        assert!(validate_group_name("bus").is_ok());
        assert!(validate_group_name("").is_err());
        assert!(validate_group_name("bad\nname").is_err());
        assert!(validate_group_name(&"g".repeat(MAX_GROUP_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_add_remove_connection() {
        let registry = ClientRegistry::new();
        registry.add(handle("c1"));
        assert!(registry.contains("c1"));
        assert_eq!(registry.len(), 1);

        registry.remove("c1");
        assert!(!registry.contains("c1"));
        assert!(registry.get("c1").is_none());
    }

    #[test]
    fn test_groups_are_lazy_and_dropped_when_empty() {
        let registry = ClientRegistry::new();
        registry.add(handle("c1"));

        assert!(!registry.group_exists("g"));
        registry.add_to_group("g", "c1").unwrap();
        assert!(registry.group_exists("g"));
        assert_eq!(registry.group_members("g"), vec!["c1".to_owned()]);

        registry.remove_from_group("g", "c1").unwrap();
        assert!(!registry.group_exists("g"));
    }

    #[test]
    fn test_remove_strips_every_group() {
        let registry = ClientRegistry::new();
        registry.add(handle("c1"));
        registry.add(handle("c2"));
        registry.add_to_group("a", "c1").unwrap();
        registry.add_to_group("b", "c1").unwrap();
        registry.add_to_group("b", "c2").unwrap();

        registry.remove("c1");

        assert!(!registry.group_exists("a"));
        assert_eq!(registry.group_members("b"), vec!["c2".to_owned()]);
        for group in ["a", "b"] {
            assert!(!registry.group_members(group).contains(&"c1".to_owned()));
        }
    }

    #[test]
    fn test_snapshots_are_detached() {
        let registry = ClientRegistry::new();
        registry.add(handle("c1"));
        registry.add_to_group("g", "c1").unwrap();

        let snapshot = registry.group_members("g");
        registry.remove("c1");
        // The snapshot still lists the member; delivery-time lookup decides.
        assert_eq!(snapshot, vec!["c1".to_owned()]);
        assert!(registry.get("c1").is_none());
    }
}
