//! Connection/group registry.
//!
//! Single source of truth for "who is listening". Every read and write of
//! membership goes through one mutex; broadcasts iterate a snapshot taken
//! under that lock and never hold it while delivering.

use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::envelope::TransportKind;
use crate::error::RelayError;

/// Group every negotiated client belongs to.
pub const GLOBAL_GROUP: &str = "Global";

/// One logical peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Client {
    pub connection_id: String,
    pub transport: TransportKind,
}

#[derive(Debug, Default)]
struct Membership {
    /// Records of every client in the Global group, keyed by connection id.
    clients: HashMap<String, Client>,
    /// Group name -> member connection ids, in join order.
    groups: HashMap<String, Vec<String>>,
}

impl Membership {
    fn remove(&mut self, group: &str, connection_id: &str) -> bool {
        let Some(members) = self.groups.get_mut(group) else {
            return false;
        };
        let Some(index) = members.iter().position(|id| id == connection_id) else {
            return false;
        };
        members.remove(index);
        if members.is_empty() {
            self.groups.remove(group);
            debug!(group, "group removed (empty)");
        }
        true
    }
}

#[derive(Debug, Default)]
pub struct GroupRegistry {
    state: Mutex<Membership>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client record and append it to the Global group.
    pub async fn add_client(&self, connection_id: &str, transport: TransportKind) -> Client {
        let client = Client {
            connection_id: connection_id.to_string(),
            transport,
        };
        let mut state = self.state.lock().await;
        if state
            .clients
            .insert(connection_id.to_string(), client.clone())
            .is_none()
        {
            state
                .groups
                .entry(GLOBAL_GROUP.to_string())
                .or_default()
                .push(connection_id.to_string());
        }
        client
    }

    /// Resolve a connection id through the Global group.
    pub async fn lookup_client(&self, connection_id: &str) -> Option<Client> {
        self.state.lock().await.clients.get(connection_id).cloned()
    }

    /// Add a known client to `group`. Returns `false` if it was already a member.
    pub async fn add_to_group(&self, group: &str, connection_id: &str) -> Result<bool, RelayError> {
        let mut state = self.state.lock().await;
        if !state.clients.contains_key(connection_id) {
            return Err(RelayError::UnknownClient(connection_id.to_string()));
        }
        let members = state.groups.entry(group.to_string()).or_default();
        if members.iter().any(|id| id == connection_id) {
            debug!(group, connection_id, "already a member");
            return Ok(false);
        }
        members.push(connection_id.to_string());
        debug!(group, connection_id, members = members.len(), "joined group");
        Ok(true)
    }

    /// Remove a client from `group`, deleting the group once it is empty.
    ///
    /// Global membership is never given up here; a client leaves Global only
    /// through [`GroupRegistry::remove_from_all_groups`].
    pub async fn remove_from_group(&self, group: &str, connection_id: &str) -> bool {
        if group == GLOBAL_GROUP {
            debug!(connection_id, "refusing to leave the Global group");
            return false;
        }
        self.state.lock().await.remove(group, connection_id)
    }

    /// Drop every membership of `connection_id`, including its client record.
    /// Returns how many groups it was removed from.
    pub async fn remove_from_all_groups(&self, connection_id: &str) -> usize {
        let mut state = self.state.lock().await;
        let names: Vec<String> = state.groups.keys().cloned().collect();
        let removed = names
            .iter()
            .filter(|group| state.remove(group, connection_id))
            .count();
        state.clients.remove(connection_id);
        debug!(connection_id, removed, "removed from all groups");
        removed
    }

    /// Members of `group` at this instant.
    pub async fn snapshot(&self, group: &str) -> Vec<Client> {
        let state = self.state.lock().await;
        state
            .groups
            .get(group)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| state.clients.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run `f` for every member of `group`, over a snapshot taken up front.
    pub async fn for_each_in_group<F>(&self, group: &str, mut f: F)
    where
        F: FnMut(&Client),
    {
        for client in self.snapshot(group).await {
            f(&client);
        }
    }

    /// Names of the groups `connection_id` belongs to, sorted.
    pub async fn groups_of(&self, connection_id: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .groups
            .iter()
            .filter(|(_, members)| members.iter().any(|id| id == connection_id))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.groups.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with(ids: &[&str]) -> GroupRegistry {
        let registry = GroupRegistry::new();
        for id in ids {
            registry.add_client(id, TransportKind::WebSocket).await;
        }
        registry
    }

    fn ids(clients: &[Client]) -> Vec<&str> {
        clients.iter().map(|c| c.connection_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_add_client_joins_global() {
        let registry = registry_with(&["a", "b"]).await;
        assert_eq!(ids(&registry.snapshot(GLOBAL_GROUP).await), vec!["a", "b"]);
        assert_eq!(
            registry.lookup_client("a").await,
            Some(Client {
                connection_id: "a".into(),
                transport: TransportKind::WebSocket
            })
        );
        assert!(registry.lookup_client("zzz").await.is_none());
    }

    #[tokio::test]
    async fn test_add_client_twice_keeps_one_global_entry() {
        let registry = registry_with(&["a"]).await;
        registry.add_client("a", TransportKind::LongPoll).await;
        assert_eq!(registry.snapshot(GLOBAL_GROUP).await.len(), 1);
        assert_eq!(
            registry.lookup_client("a").await.unwrap().transport,
            TransportKind::LongPoll
        );
    }

    #[tokio::test]
    async fn test_add_to_group_is_idempotent() {
        let registry = registry_with(&["a"]).await;
        assert!(registry.add_to_group("room1", "a").await.unwrap());
        assert!(!registry.add_to_group("room1", "a").await.unwrap());
        assert_eq!(registry.snapshot("room1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_add_unknown_client_to_group_fails() {
        let registry = GroupRegistry::new();
        assert_eq!(
            registry.add_to_group("room1", "ghost").await,
            Err(RelayError::UnknownClient("ghost".into()))
        );
        assert!(registry.group_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_group_is_deleted() {
        let registry = registry_with(&["a", "b"]).await;
        registry.add_to_group("room1", "a").await.unwrap();
        registry.add_to_group("room1", "b").await.unwrap();

        assert!(registry.remove_from_group("room1", "a").await);
        assert_eq!(ids(&registry.snapshot("room1").await), vec!["b"]);

        assert!(registry.remove_from_group("room1", "b").await);
        assert!(!registry.group_names().await.contains(&"room1".to_string()));
        assert!(!registry.remove_from_group("room1", "b").await);
    }

    #[tokio::test]
    async fn test_remove_from_all_groups_leaves_no_residue() {
        let registry = registry_with(&["a", "b"]).await;
        registry.add_to_group("room1", "a").await.unwrap();
        registry.add_to_group("room2", "a").await.unwrap();
        registry.add_to_group("room2", "b").await.unwrap();

        assert_eq!(registry.remove_from_all_groups("a").await, 3);
        assert!(registry.lookup_client("a").await.is_none());
        assert!(registry.groups_of("a").await.is_empty());
        assert_eq!(registry.group_names().await, vec!["Global", "room2"]);

        // Second removal is a no-op.
        assert_eq!(registry.remove_from_all_groups("a").await, 0);
    }

    #[tokio::test]
    async fn test_snapshot_is_not_affected_by_later_leave() {
        let registry = registry_with(&["a", "b"]).await;
        registry.add_to_group("room1", "a").await.unwrap();
        registry.add_to_group("room1", "b").await.unwrap();

        let mut seen = Vec::new();
        let snapshot = registry.snapshot("room1").await;
        registry.remove_from_group("room1", "b").await;
        for client in &snapshot {
            seen.push(client.connection_id.clone());
        }
        assert_eq!(seen, vec!["a", "b"]);

        let mut after = Vec::new();
        registry
            .for_each_in_group("room1", |c| after.push(c.connection_id.clone()))
            .await;
        assert_eq!(after, vec!["a"]);
    }

    #[tokio::test]
    async fn test_membership_queries() {
        let registry = registry_with(&["a"]).await;
        registry.add_to_group("zeta", "a").await.unwrap();
        registry.add_to_group("alpha", "a").await.unwrap();
        assert_eq!(registry.groups_of("a").await, vec!["Global", "alpha", "zeta"]);
        assert!(registry.groups_of("b").await.is_empty());
    }

    #[tokio::test]
    async fn test_leaving_global_is_refused() {
        let registry = registry_with(&["a", "b"]).await;
        registry.add_to_group("room1", "a").await.unwrap();

        assert!(!registry.remove_from_group(GLOBAL_GROUP, "a").await);
        assert!(registry.lookup_client("a").await.is_some());
        assert_eq!(ids(&registry.snapshot(GLOBAL_GROUP).await), vec!["a", "b"]);
        assert_eq!(registry.groups_of("a").await, vec!["Global", "room1"]);
    }
}
