//! Change source: push feed with a one-way fallback to polling.
//!
//! ```text
//! Unstarted --feed opened--> PushActive --feed error--> PullActive
//!     |                                                     ^
//!     +------------- setup failure or timeout --------------+
//! any state --stop--> Stopped
//! ```
//!
//! Each change is reported as a [`ChangeTrigger`] on the owner's channel.
//! Sends never block: when the owner still has an unread signal the new one
//! is folded into it, since every consumer re-reads full state anyway.
//! The feed is attempted once per source; after a fallback the source polls
//! until stopped.

use cart_store::CartStore;
use futures::StreamExt;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Poll period once the source has fallen back to pulling.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Deadline for opening the push feed.
pub const DEFAULT_FEED_SETUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a change source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Unstarted,
    PushActive,
    PullActive,
    Stopped,
}

/// What produced a change signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeTrigger {
    Feed,
    Poll,
}

impl ChangeTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeTrigger::Feed => "feed",
            ChangeTrigger::Poll => "poll",
        }
    }
}

/// Timing knobs of a change source.
#[derive(Debug, Clone, Copy)]
pub struct SourceSettings {
    pub poll_interval: Duration,
    pub feed_setup_timeout: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            feed_setup_timeout: DEFAULT_FEED_SETUP_TIMEOUT,
        }
    }
}

/// Channel a source reports into. Capacity 1: pending signals conflate.
pub fn signal_channel() -> (mpsc::Sender<ChangeTrigger>, mpsc::Receiver<ChangeTrigger>) {
    mpsc::channel(1)
}

enum PushOutcome {
    Failed,
    Shutdown,
    OwnerGone,
}

/// A not-yet-started change source over a cart store.
pub struct ChangeSource {
    store: Arc<dyn CartStore>,
    settings: SourceSettings,
    owner: String,
}

impl ChangeSource {
    /// `owner` labels the source in logs.
    pub fn new(store: Arc<dyn CartStore>, settings: SourceSettings, owner: impl Into<String>) -> Self {
        Self {
            store,
            settings,
            owner: owner.into(),
        }
    }

    /// Spawn the source task. Signals go to `on_change` until the handle is
    /// stopped or the receiver is dropped.
    pub fn start(self, on_change: mpsc::Sender<ChangeTrigger>) -> ChangeSourceHandle {
        let (state_tx, state_rx) = watch::channel(SourceState::Unstarted);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(on_change, state_tx, shutdown_rx));

        ChangeSourceHandle {
            state_rx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn run(
        self,
        on_change: mpsc::Sender<ChangeTrigger>,
        state_tx: watch::Sender<SourceState>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let opened = tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                state_tx.send_replace(SourceState::Stopped);
                return;
            }

            opened = timeout(self.settings.feed_setup_timeout, self.store.watch()) => opened,
        };

        let feed = match opened {
            Ok(Ok(feed)) => Some(feed),
            Ok(Err(e)) => {
                warn!("[{}] Change feed unavailable, polling instead: {}", self.owner, e);
                None
            }
            Err(_) => {
                warn!(
                    "[{}] Change feed not ready after {:?}, polling instead",
                    self.owner, self.settings.feed_setup_timeout
                );
                None
            }
        };

        if let Some(mut feed) = feed {
            state_tx.send_replace(SourceState::PushActive);
            info!("[{}] Change feed active", self.owner);

            let outcome = loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown_rx => break PushOutcome::Shutdown,

                    item = feed.next() => match item {
                        Some(Ok(event)) => {
                            debug!("[{}] Change on {:?}", self.owner, event.key);
                            if !notify(&on_change, ChangeTrigger::Feed) {
                                break PushOutcome::OwnerGone;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("[{}] Change feed failed, polling instead: {}", self.owner, e);
                            break PushOutcome::Failed;
                        }
                        None => {
                            warn!("[{}] Change feed ended, polling instead", self.owner);
                            break PushOutcome::Failed;
                        }
                    }
                }
            };

            // Released before polling starts.
            drop(feed);

            match outcome {
                PushOutcome::Failed => {}
                PushOutcome::Shutdown | PushOutcome::OwnerGone => {
                    state_tx.send_replace(SourceState::Stopped);
                    debug!("[{}] Change source stopped", self.owner);
                    return;
                }
            }
        }

        counter!("change_source_fallbacks_total").increment(1);
        state_tx.send_replace(SourceState::PullActive);
        info!(
            "[{}] Polling every {:?}",
            self.owner, self.settings.poll_interval
        );

        // First tick fires immediately.
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => break,

                _ = ticker.tick() => {
                    if !notify(&on_change, ChangeTrigger::Poll) {
                        break;
                    }
                }
            }
        }

        state_tx.send_replace(SourceState::Stopped);
        debug!("[{}] Change source stopped", self.owner);
    }
}

/// Returns false once the owner has dropped its receiver.
fn notify(on_change: &mpsc::Sender<ChangeTrigger>, trigger: ChangeTrigger) -> bool {
    match on_change.try_send(trigger) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            counter!("dashboard_changes_coalesced_total").increment(1);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Owner's handle to a running change source.
///
/// Dropping the handle without [`stop`](Self::stop) aborts the task.
pub struct ChangeSourceHandle {
    state_rx: watch::Receiver<SourceState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ChangeSourceHandle {
    pub fn state(&self) -> SourceState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn state_receiver(&self) -> watch::Receiver<SourceState> {
        self.state_rx.clone()
    }

    /// Stop the source and wait for its task to finish. Consumes the
    /// handle, so a source is stopped at most once.
    pub async fn stop(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Change source task panicked: {}", e);
                }
            }
        }
    }
}

impl Drop for ChangeSourceHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cart_metrics::{RawCartRecord, ScopeId};
    use cart_store::{ChangeStream, MemoryCartStore};
    use serde_json::json;
    use tokio::time::Instant;

    fn settings() -> SourceSettings {
        SourceSettings {
            poll_interval: Duration::from_secs(10),
            feed_setup_timeout: Duration::from_secs(5),
        }
    }

    fn cart(app: u64) -> RawCartRecord {
        RawCartRecord {
            app: json!(app),
            cart_counter: json!(1),
            cart_counter_max: json!(10),
            ..Default::default()
        }
    }

    async fn wait_for_state(handle: &ChangeSourceHandle, wanted: SourceState) {
        let mut rx = handle.state_receiver();
        rx.wait_for(|state| *state == wanted).await.unwrap();
    }

    /// Store whose feed never finishes opening.
    struct HangingFeedStore;

    #[async_trait]
    impl CartStore for HangingFeedStore {
        async fn ping(&self) -> cart_store::Result<()> {
            Ok(())
        }

        async fn find_by_scope(&self, _scope: ScopeId) -> cart_store::Result<Vec<RawCartRecord>> {
            Ok(Vec::new())
        }

        async fn watch(&self) -> cart_store::Result<ChangeStream> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_fires_immediately_then_every_interval() {
        let store = Arc::new(MemoryCartStore::without_feed());
        let (tx, mut rx) = signal_channel();
        let handle = ChangeSource::new(store.clone(), settings(), "test").start(tx);

        let started = Instant::now();
        assert_eq!(rx.recv().await, Some(ChangeTrigger::Poll));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(handle.state(), SourceState::PullActive);

        assert_eq!(rx.recv().await, Some(ChangeTrigger::Poll));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(rx.recv().await, Some(ChangeTrigger::Poll));
        assert_eq!(started.elapsed(), Duration::from_secs(20));

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_failure_falls_back_once() {
        let store = Arc::new(MemoryCartStore::without_feed());
        let (tx, mut rx) = signal_channel();
        let handle = ChangeSource::new(store.clone(), settings(), "test").start(tx);

        for _ in 0..4 {
            assert_eq!(rx.recv().await, Some(ChangeTrigger::Poll));
        }
        assert_eq!(store.watch_calls(), 1);
        assert_eq!(handle.state(), SourceState::PullActive);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_timeout_counts_as_failure() {
        let (tx, mut rx) = signal_channel();
        let handle = ChangeSource::new(Arc::new(HangingFeedStore), settings(), "test").start(tx);

        let started = Instant::now();
        assert_eq!(rx.recv().await, Some(ChangeTrigger::Poll));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(handle.state(), SourceState::PullActive);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_delivers_changes() {
        let store = Arc::new(MemoryCartStore::new());
        let (tx, mut rx) = signal_channel();
        let handle = ChangeSource::new(store.clone(), settings(), "test").start(tx);

        wait_for_state(&handle, SourceState::PushActive).await;
        assert_eq!(store.open_feeds(), 1);

        store.upsert("a", cart(5));
        assert_eq!(rx.recv().await, Some(ChangeTrigger::Feed));
        store.upsert("b", cart(7));
        assert_eq!(rx.recv().await, Some(ChangeTrigger::Feed));

        handle.stop().await;
        assert_eq!(store.open_feeds(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_failure_closes_feed_before_polling() {
        let store = Arc::new(MemoryCartStore::new());
        let (tx, mut rx) = signal_channel();
        let handle = ChangeSource::new(store.clone(), settings(), "test").start(tx);
        wait_for_state(&handle, SourceState::PushActive).await;

        store.fail_feeds("connection reset");
        wait_for_state(&handle, SourceState::PullActive).await;
        assert_eq!(store.open_feeds(), 0);

        assert_eq!(rx.recv().await, Some(ChangeTrigger::Poll));

        // Writes are no longer pushed; only the timer reports.
        store.upsert("a", cart(5));
        assert_eq!(rx.recv().await, Some(ChangeTrigger::Poll));
        assert_eq!(store.watch_calls(), 1);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bursts_conflate() {
        let store = Arc::new(MemoryCartStore::new());
        let (tx, mut rx) = signal_channel();
        let handle = ChangeSource::new(store.clone(), settings(), "test").start(tx);
        wait_for_state(&handle, SourceState::PushActive).await;

        for i in 0..5 {
            store.upsert(format!("c{}", i), cart(5));
        }
        // Let the source drain the feed.
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(rx.recv().await, Some(ChangeTrigger::Feed));
        assert!(rx.try_recv().is_err());

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_signals() {
        let store = Arc::new(MemoryCartStore::without_feed());
        let (tx, mut rx) = signal_channel();
        let handle = ChangeSource::new(store, settings(), "test").start(tx);
        let state = handle.state_receiver();

        assert_eq!(rx.recv().await, Some(ChangeTrigger::Poll));
        handle.stop().await;

        assert_eq!(*state.borrow(), SourceState::Stopped);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_owner_goes_away() {
        let store = Arc::new(MemoryCartStore::without_feed());
        let (tx, rx) = signal_channel();
        let handle = ChangeSource::new(store, settings(), "test").start(tx);
        drop(rx);

        wait_for_state(&handle, SourceState::Stopped).await;
    }
}
