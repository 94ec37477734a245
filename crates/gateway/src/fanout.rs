//! Per-scope dispatch workers for the global resource model.
//!
//! One task per active scope runs [`Dispatcher::broadcast`] serially. Its
//! inbox holds a single pending signal, so a burst of changes arriving
//! while a dispatch is in flight yields exactly one follow-up dispatch.
//! A slow or hung fetch only holds up its own scope.

use crate::dispatcher::Dispatcher;
use cart_metrics::ScopeId;
use dashmap::DashMap;
use metrics::counter;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct WorkerHandle {
    tx: mpsc::Sender<()>,
    join_handle: JoinHandle<()>,
}

/// Set of scope workers keyed by scope.
pub struct ScopeWorkers {
    dispatcher: Arc<Dispatcher>,
    workers: DashMap<ScopeId, WorkerHandle>,
}

impl ScopeWorkers {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            workers: DashMap::new(),
        }
    }

    /// Ask the worker of `scope` to dispatch, spawning it if needed.
    pub fn notify(&self, scope: ScopeId) {
        let mut worker = self
            .workers
            .entry(scope)
            .or_insert_with(|| self.spawn_worker(scope));

        match worker.tx.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => {
                counter!("dashboard_changes_coalesced_total").increment(1);
            }
            Err(TrySendError::Closed(())) => {
                warn!("Worker for scope {} exited, respawning", scope);
                *worker = self.spawn_worker(scope);
                let _ = worker.tx.try_send(());
            }
        }
    }

    fn spawn_worker(&self, scope: ScopeId) -> WorkerHandle {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let dispatcher = self.dispatcher.clone();

        let join_handle = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                match dispatcher.broadcast(scope).await {
                    Ok(delivered) => debug!("Scope {} update reached {} clients", scope, delivered),
                    Err(e) => {
                        warn!("Skipped update of scope {}: {}", scope, e);
                        counter!("dashboard_dispatch_errors_total").increment(1);
                    }
                }
            }
        });

        debug!("Spawned dispatch worker for scope {}", scope);
        WorkerHandle { tx, join_handle }
    }

    /// Stop the workers of scopes not in `active`.
    pub fn retain_active(&self, active: &BTreeSet<ScopeId>) {
        self.workers.retain(|scope, worker| {
            let keep = active.contains(scope);
            if !keep {
                worker.join_handle.abort();
                debug!("Retired dispatch worker for scope {}", scope);
            }
            keep
        });
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Abort every worker.
    pub fn shutdown(&self) {
        self.workers.retain(|_, worker| {
            worker.join_handle.abort();
            false
        });
    }
}

impl Drop for ScopeWorkers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientRegistry, ClientState};
    use crate::subscription::SubscriptionRegistry;
    use axum::extract::ws::Message;
    use cart_metrics::RawCartRecord;
    use cart_store::MemoryCartStore;
    use serde_json::json;
    use std::time::Duration;

    fn scope(id: u64) -> ScopeId {
        ScopeId::new(id).unwrap()
    }

    fn cart(app: u64) -> RawCartRecord {
        RawCartRecord {
            app: json!(app),
            cart_counter: json!(3),
            cart_counter_max: json!(10),
            ..Default::default()
        }
    }

    struct Fixture {
        store: Arc<MemoryCartStore>,
        clients: Arc<ClientRegistry>,
        subscriptions: Arc<SubscriptionRegistry>,
        workers: ScopeWorkers,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryCartStore::new());
        let clients = Arc::new(ClientRegistry::new());
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            clients.clone(),
            subscriptions.clone(),
        ));
        Fixture {
            store,
            clients,
            subscriptions,
            workers: ScopeWorkers::new(dispatcher),
        }
    }

    fn listen(f: &Fixture, to: ScopeId) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(16);
        let client = Arc::new(ClientState::new(tx));
        f.clients.register(client.clone());
        f.subscriptions.subscribe(client.id, to);
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_scope_does_not_block_others() {
        let f = fixture();
        f.store.upsert("a", cart(5));
        f.store.upsert("b", cart(7));
        f.store.stall_scope(scope(5));

        let mut rx5 = listen(&f, scope(5));
        let mut rx7 = listen(&f, scope(7));

        f.workers.notify(scope(5));
        f.workers.notify(scope(7));

        let msg = tokio::time::timeout(Duration::from_secs(1), rx7.recv())
            .await
            .unwrap();
        assert!(msg.is_some());
        assert!(rx5.try_recv().is_err());
        assert_eq!(f.workers.worker_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_while_busy() {
        let f = fixture();
        f.store.upsert("a", cart(5));
        let mut rx = listen(&f, scope(5));

        for _ in 0..10 {
            f.workers.notify(scope(5));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received >= 1 && received <= 2, "received {}", received);
        assert_eq!(f.store.find_calls(), received);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retain_active_retires_workers() {
        let f = fixture();
        f.workers.notify(scope(5));
        f.workers.notify(scope(7));
        assert_eq!(f.workers.worker_count(), 2);

        f.workers.retain_active(&BTreeSet::from([scope(7)]));
        assert_eq!(f.workers.worker_count(), 1);

        f.workers.shutdown();
        assert_eq!(f.workers.worker_count(), 0);
    }
}
