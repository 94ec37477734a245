//! Update dispatcher: store → metrics → WebSocket clients.
//!
//! Every dispatch reads the full current state of one scope, recomputes the
//! dashboard and sends it. No deltas are kept, so a dropped or failed
//! dispatch is repaired by the next one.

use crate::client::{ClientRegistry, ClientState};
use crate::error::Result;
use crate::protocol::ServerMessage;
use crate::subscription::SubscriptionRegistry;
use cart_metrics::{DashboardPayload, ScopeId};
use cart_store::CartStore;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, warn};

/// Computes dashboard payloads and delivers them to subscribers.
pub struct Dispatcher {
    store: Arc<dyn CartStore>,
    clients: Arc<ClientRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn CartStore>,
        clients: Arc<ClientRegistry>,
        subscriptions: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            store,
            clients,
            subscriptions,
        }
    }

    /// Current dashboard of one scope.
    pub async fn snapshot(&self, scope: ScopeId) -> Result<DashboardPayload> {
        let mut records = self.store.find_by_scope(scope).await?;

        let fetched = records.len();
        records.retain(|record| record.scope() == Some(scope));
        if records.len() != fetched {
            warn!(
                "Dropped {} records outside scope {}",
                fetched - records.len(),
                scope
            );
        }

        Ok(DashboardPayload::from_records(records))
    }

    /// Send the current dashboard of `scope` to one connection that just
    /// subscribed. Nothing is sent if it no longer listens to `scope` once
    /// the fetch completes.
    pub async fn initial_sync(&self, client: &ClientState, scope: ScopeId) -> Result<()> {
        self.deliver(client, scope, "initial").await
    }

    /// Re-send the current dashboard of `scope` to one connection.
    pub async fn sync_connection(&self, client: &ClientState, scope: ScopeId) -> Result<()> {
        self.deliver(client, scope, "connection").await
    }

    async fn deliver(&self, client: &ClientState, scope: ScopeId, kind: &'static str) -> Result<()> {
        let payload = self.snapshot(scope).await?;

        // The connection may have moved while the fetch was in flight.
        if self.subscriptions.scope_of(&client.id) != Some(scope) {
            debug!("Client {} left scope {} during fetch, dropping update", client.id, scope);
            return Ok(());
        }

        client.send(&ServerMessage::DashboardUpdate(payload))?;
        counter!("dashboard_dispatches_total", "kind" => kind).increment(1);
        debug!("Sent scope {} dashboard to {} ({})", scope, client.id, kind);
        Ok(())
    }

    /// Send the current dashboard of `scope` to all its subscribers.
    ///
    /// A scope without subscribers is skipped before touching the store.
    /// Returns how many connections accepted the update.
    pub async fn broadcast(&self, scope: ScopeId) -> Result<usize> {
        if !self.subscriptions.has_subscribers(scope) {
            debug!("Scope {} has no subscribers, skipping", scope);
            return Ok(0);
        }

        let payload = self.snapshot(scope).await?;
        let json = serde_json::to_string(&ServerMessage::DashboardUpdate(payload))?;

        // Membership is read after the fetch: late joiners get this update,
        // connections that left during the fetch do not.
        let subscribers = self.subscriptions.subscribers(scope);
        let delivered = self.clients.send_to(&subscribers, &json);

        counter!("dashboard_dispatches_total", "kind" => "broadcast").increment(1);
        debug!(
            "Broadcast scope {} to {}/{} subscribers",
            scope,
            delivered,
            subscribers.len()
        );
        Ok(delivered)
    }
}
