//! Connection lifecycle: connect, subscribe, disconnect, shutdown.
//!
//! Owns the registries and decides who owns change sources:
//!
//! - [`ResourceModel::Global`]: one change source, started on the first
//!   valid subscription, feeds a fan-out task that notifies one
//!   [`ScopeWorkers`] worker per active scope. Disconnects never touch it;
//!   [`LiveUpdates::shutdown`] stops it.
//! - [`ResourceModel::PerConnection`]: each connection starts its own source
//!   on its first valid subscription. Its signals re-sync that connection
//!   with whatever scope it listens to at the time. Disconnect stops it.

use crate::change_source::{
    signal_channel, ChangeSource, ChangeSourceHandle, ChangeTrigger, SourceSettings, SourceState,
};
use crate::client::{ClientId, ClientRegistry, ClientState};
use crate::config::ResourceModel;
use crate::dispatcher::Dispatcher;
use crate::fanout::ScopeWorkers;
use crate::subscription::{SubscribeOutcome, SubscriptionRegistry};
use axum::extract::ws::Message;
use cart_metrics::ScopeId;
use cart_store::CartStore;
use metrics::{counter, gauge};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One live connection, owned by its socket task.
pub struct Connection {
    client: Arc<ClientState>,
    watch: Option<ConnectionWatch>,
}

impl Connection {
    pub fn id(&self) -> ClientId {
        self.client.id
    }

    pub fn client(&self) -> &Arc<ClientState> {
        &self.client
    }

    /// State of this connection's own change source, if it has one.
    pub fn source_state(&self) -> Option<SourceState> {
        self.watch.as_ref().map(|w| w.source.state())
    }
}

/// Change source owned by one connection plus the task turning its signals
/// into re-syncs.
struct ConnectionWatch {
    source: ChangeSourceHandle,
    forwarder: JoinHandle<()>,
}

impl ConnectionWatch {
    async fn stop(self) {
        self.source.stop().await;
        // The forwarder ends once the source drops its sender; abort covers a
        // re-sync stuck on the store.
        self.forwarder.abort();
        let _ = self.forwarder.await;
    }
}

struct GlobalWatch {
    source: ChangeSourceHandle,
    fan_out: JoinHandle<()>,
    workers: Arc<ScopeWorkers>,
}

/// Live dashboard updates for all connections of one process.
pub struct LiveUpdates {
    store: Arc<dyn CartStore>,
    clients: Arc<ClientRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    model: ResourceModel,
    settings: SourceSettings,
    global: Mutex<Option<GlobalWatch>>,
    closed: AtomicBool,
}

impl LiveUpdates {
    pub fn new(store: Arc<dyn CartStore>, model: ResourceModel, settings: SourceSettings) -> Self {
        let clients = Arc::new(ClientRegistry::new());
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            clients.clone(),
            subscriptions.clone(),
        ));

        Self {
            store,
            clients,
            subscriptions,
            dispatcher,
            model,
            settings,
            global: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn model(&self) -> ResourceModel {
        self.model
    }

    /// State of the global change source; `None` until it is started.
    pub async fn global_source_state(&self) -> Option<SourceState> {
        self.global.lock().await.as_ref().map(|g| g.source.state())
    }

    /// Register a new connection writing to `tx`. It listens to nothing yet.
    pub fn connect(&self, tx: mpsc::Sender<Message>) -> Connection {
        let client = Arc::new(ClientState::new(tx));
        self.clients.register(client.clone());

        counter!("gateway_connections_total").increment(1);
        gauge!("gateway_active_connections").set(self.clients.client_count() as f64);

        Connection {
            client,
            watch: None,
        }
    }

    /// Handle a dashboard subscription request.
    ///
    /// An invalid app id is ignored: no state changes and nothing is sent.
    /// Otherwise the connection moves to the scope, change detection is
    /// ensured for it and the current dashboard is sent to this connection.
    pub async fn request_dashboard_data(
        &self,
        conn: &mut Connection,
        raw_app: &Value,
    ) -> Option<ScopeId> {
        let Some(scope) = ScopeId::parse(raw_app) else {
            debug!("Client {} sent invalid app id {}, ignoring", conn.id(), raw_app);
            return None;
        };

        match self.subscriptions.subscribe(conn.id(), scope) {
            SubscribeOutcome::Joined => info!("Client {} joined scope {}", conn.id(), scope),
            SubscribeOutcome::Moved { from } => {
                info!("Client {} moved from scope {} to {}", conn.id(), from, scope)
            }
            SubscribeOutcome::Unchanged => debug!("Client {} re-requested scope {}", conn.id(), scope),
        }
        gauge!("gateway_active_scopes").set(self.subscriptions.active_scope_count() as f64);

        match self.model {
            ResourceModel::Global => self.ensure_global_watch().await,
            ResourceModel::PerConnection => {
                if conn.watch.is_none() && !self.closed.load(Ordering::SeqCst) {
                    conn.watch = Some(self.start_connection_watch(conn.client.clone()));
                }
            }
        }

        if let Err(e) = self.dispatcher.initial_sync(&conn.client, scope).await {
            warn!("Initial sync of scope {} for {} failed: {}", scope, conn.id(), e);
            counter!("dashboard_dispatch_errors_total").increment(1);
        }

        Some(scope)
    }

    async fn ensure_global_watch(&self) {
        let mut global = self.global.lock().await;
        if global.is_some() || self.closed.load(Ordering::SeqCst) {
            return;
        }

        let (tx, rx) = signal_channel();
        let source = ChangeSource::new(self.store.clone(), self.settings, "global").start(tx);
        let workers = Arc::new(ScopeWorkers::new(self.dispatcher.clone()));
        let fan_out = tokio::spawn(fan_out(rx, self.subscriptions.clone(), workers.clone()));

        info!("Global change source started");
        *global = Some(GlobalWatch {
            source,
            fan_out,
            workers,
        });
    }

    fn start_connection_watch(&self, client: Arc<ClientState>) -> ConnectionWatch {
        let (tx, mut rx) = signal_channel();
        let source =
            ChangeSource::new(self.store.clone(), self.settings, format!("client-{}", client.id))
                .start(tx);

        debug!("Started change source for client {}", client.id);

        let dispatcher = self.dispatcher.clone();
        let subscriptions = self.subscriptions.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(trigger) = rx.recv().await {
                counter!("dashboard_changes_received_total", "trigger" => trigger.as_str())
                    .increment(1);

                let Some(scope) = subscriptions.scope_of(&client.id) else {
                    continue;
                };
                if let Err(e) = dispatcher.sync_connection(&client, scope).await {
                    warn!("Skipped update of scope {} for {}: {}", scope, client.id, e);
                    counter!("dashboard_dispatch_errors_total").increment(1);
                }
            }
        });

        ConnectionWatch { source, forwarder }
    }

    /// Release everything the connection holds. Consumes it, so release
    /// happens once.
    pub async fn disconnect(&self, conn: Connection) {
        let Connection { client, watch } = conn;

        if let Some(scope) = self.subscriptions.unsubscribe(&client.id) {
            debug!("Client {} left scope {}", client.id, scope);
        }
        if let Some(watch) = watch {
            watch.stop().await;
        }
        self.clients.unregister(&client.id);

        counter!("gateway_disconnections_total").increment(1);
        gauge!("gateway_active_connections").set(self.clients.client_count() as f64);
        gauge!("gateway_active_scopes").set(self.subscriptions.active_scope_count() as f64);
    }

    /// Stop the global change source and its workers. Later calls do nothing,
    /// and no new global source is started afterwards.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let Some(global) = self.global.lock().await.take() else {
            return;
        };

        info!("Stopping global change source");
        global.source.stop().await;
        global.fan_out.abort();
        let _ = global.fan_out.await;
        global.workers.shutdown();
    }
}

/// Relay each global change signal to the workers of all active scopes.
async fn fan_out(
    mut rx: mpsc::Receiver<ChangeTrigger>,
    subscriptions: Arc<SubscriptionRegistry>,
    workers: Arc<ScopeWorkers>,
) {
    while let Some(trigger) = rx.recv().await {
        counter!("dashboard_changes_received_total", "trigger" => trigger.as_str()).increment(1);

        let active = subscriptions.active_scopes();
        workers.retain_active(&active);
        gauge!("gateway_active_scopes").set(active.len() as f64);

        for scope in active {
            workers.notify(scope);
        }
    }
    debug!("Global change signals ended");
}
