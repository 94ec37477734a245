//! Scope membership of connections.
//!
//! Each connection listens to at most one scope. Two indexes are kept in
//! step: client → scope for moves and teardown, and scope → clients for
//! fan-out. A scope with no members is removed from the second index, so
//! `active_scopes` never reports an empty room.

use crate::client::ClientId;
use cart_metrics::ScopeId;
use dashmap::{DashMap, DashSet};
use std::collections::BTreeSet;
use tracing::debug;

/// Result of [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The connection had no scope before.
    Joined,
    /// The connection left `from` for the new scope.
    Moved { from: ScopeId },
    /// Already a member of this scope.
    Unchanged,
}

/// Concurrent scope membership registry.
pub struct SubscriptionRegistry {
    memberships: DashMap<ClientId, ScopeId>,
    rooms: DashMap<ScopeId, DashSet<ClientId>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            memberships: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    /// Put a connection in `scope`, leaving its previous scope first.
    pub fn subscribe(&self, client_id: ClientId, scope: ScopeId) -> SubscribeOutcome {
        let previous = self.memberships.insert(client_id, scope);

        let outcome = match previous {
            Some(old) if old == scope => SubscribeOutcome::Unchanged,
            Some(old) => {
                self.leave_room(old, &client_id);
                SubscribeOutcome::Moved { from: old }
            }
            None => SubscribeOutcome::Joined,
        };

        self.rooms.entry(scope).or_default().insert(client_id);
        debug!("Client {} in scope {} ({:?})", client_id, scope, outcome);
        outcome
    }

    /// Remove a connection from its scope. Unknown connections are a no-op.
    pub fn unsubscribe(&self, client_id: &ClientId) -> Option<ScopeId> {
        let (_, scope) = self.memberships.remove(client_id)?;
        self.leave_room(scope, client_id);
        debug!("Client {} left scope {}", client_id, scope);
        Some(scope)
    }

    fn leave_room(&self, scope: ScopeId, client_id: &ClientId) {
        if let Some(room) = self.rooms.get(&scope) {
            room.remove(client_id);
        }
        self.rooms.remove_if(&scope, |_, room| room.is_empty());
    }

    /// Scope the connection currently listens to.
    pub fn scope_of(&self, client_id: &ClientId) -> Option<ScopeId> {
        self.memberships.get(client_id).map(|s| *s)
    }

    /// Snapshot of the connections listening to `scope`.
    pub fn subscribers(&self, scope: ScopeId) -> Vec<ClientId> {
        self.rooms
            .get(&scope)
            .map(|room| room.iter().map(|id| *id).collect())
            .unwrap_or_default()
    }

    pub fn has_subscribers(&self, scope: ScopeId) -> bool {
        self.rooms
            .get(&scope)
            .map(|room| !room.is_empty())
            .unwrap_or(false)
    }

    /// Every scope with at least one member.
    pub fn active_scopes(&self) -> BTreeSet<ScopeId> {
        self.rooms
            .iter()
            .filter(|room| !room.value().is_empty())
            .map(|room| *room.key())
            .collect()
    }

    pub fn active_scope_count(&self) -> usize {
        self.active_scopes().len()
    }

    /// Number of connections with a scope.
    pub fn member_count(&self) -> usize {
        self.memberships.len()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn scope(id: u64) -> ScopeId {
        ScopeId::new(id).unwrap()
    }

    #[test]
    fn test_switch_scope() {
        let registry = SubscriptionRegistry::new();
        let client = Uuid::new_v4();

        assert_eq!(registry.subscribe(client, scope(5)), SubscribeOutcome::Joined);
        assert_eq!(
            registry.subscribe(client, scope(7)),
            SubscribeOutcome::Moved { from: scope(5) }
        );

        assert!(registry.subscribers(scope(5)).is_empty());
        assert!(!registry.has_subscribers(scope(5)));
        assert_eq!(registry.subscribers(scope(7)), vec![client]);
        assert_eq!(registry.scope_of(&client), Some(scope(7)));
        assert_eq!(registry.active_scopes(), BTreeSet::from([scope(7)]));
    }

    #[test]
    fn test_idempotent_join() {
        let registry = SubscriptionRegistry::new();
        let client = Uuid::new_v4();

        registry.subscribe(client, scope(5));
        assert_eq!(registry.subscribe(client, scope(5)), SubscribeOutcome::Unchanged);
        assert_eq!(registry.subscribers(scope(5)).len(), 1);
        assert_eq!(registry.member_count(), 1);
    }

    #[test]
    fn test_unsubscribe_unknown() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(registry.unsubscribe(&Uuid::new_v4()), None);
        assert!(registry.active_scopes().is_empty());
    }

    #[test]
    fn test_active_scopes() {
        let registry = SubscriptionRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        registry.subscribe(a, scope(5));
        registry.subscribe(b, scope(5));
        registry.subscribe(c, scope(9));
        assert_eq!(registry.active_scopes(), BTreeSet::from([scope(5), scope(9)]));

        assert_eq!(registry.unsubscribe(&a), Some(scope(5)));
        assert_eq!(registry.active_scope_count(), 2);

        registry.unsubscribe(&b);
        assert_eq!(registry.active_scopes(), BTreeSet::from([scope(9)]));
    }

    #[test]
    fn test_concurrent_join_leave() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let mut handles = Vec::new();

        for worker in 0..8u64 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                let mut stayed = Vec::new();
                for i in 0..200u64 {
                    let client = Uuid::new_v4();
                    registry.subscribe(client, scope(1 + (worker + i) % 3));
                    if i % 2 == 0 {
                        registry.unsubscribe(&client);
                    } else {
                        stayed.push(client);
                    }
                }
                stayed
            }));
        }

        let stayed: Vec<ClientId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(registry.member_count(), stayed.len());
        let total: usize = registry
            .active_scopes()
            .into_iter()
            .map(|s| registry.subscribers(s).len())
            .sum();
        assert_eq!(total, stayed.len());
        for client in &stayed {
            let s = registry.scope_of(client).unwrap();
            assert!(registry.subscribers(s).contains(client));
        }
    }
}
