//! In-memory cart store.
//!
//! Records live in a DashMap keyed by cart id; every write is announced on a
//! broadcast change feed. Used for `STORE_BACKEND=memory` local runs and as
//! the store in gateway tests, hence the fault switches and call counters.

use crate::error::{Error, Result};
use crate::{CartStore, ChangeEvent, ChangeStream};
use async_trait::async_trait;
use cart_metrics::{RawCartRecord, ScopeId};
use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum FeedSignal {
    Change(ChangeEvent),
    Fault(String),
}

/// Decrements the open-feed count when a feed stream is dropped.
struct FeedGuard(Arc<AtomicUsize>);

impl FeedGuard {
    fn new(open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self(open)
    }
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process cart store.
#[derive(Clone)]
pub struct MemoryCartStore {
    inner: Arc<MemoryStoreInner>,
}

struct MemoryStoreInner {
    records: DashMap<String, RawCartRecord>,
    feed: broadcast::Sender<FeedSignal>,
    feed_supported: AtomicBool,
    read_failure: AtomicBool,
    stalled_scopes: DashSet<ScopeId>,
    find_calls: AtomicUsize,
    watch_calls: AtomicUsize,
    open_feeds: Arc<AtomicUsize>,
}

impl MemoryCartStore {
    /// Create an empty store with a working change feed.
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(MemoryStoreInner {
                records: DashMap::new(),
                feed,
                feed_supported: AtomicBool::new(true),
                read_failure: AtomicBool::new(false),
                stalled_scopes: DashSet::new(),
                find_calls: AtomicUsize::new(0),
                watch_calls: AtomicUsize::new(0),
                open_feeds: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Create an empty store whose `watch` always fails.
    pub fn without_feed() -> Self {
        let store = Self::new();
        store.set_feed_supported(false);
        store
    }

    /// Insert or replace a cart and announce the change.
    pub fn upsert(&self, cart_id: impl Into<String>, record: RawCartRecord) {
        let cart_id = cart_id.into();
        self.inner.records.insert(cart_id.clone(), record);
        self.announce(cart_id);
    }

    /// Delete a cart and announce the change.
    pub fn remove(&self, cart_id: &str) -> Option<RawCartRecord> {
        let removed = self.inner.records.remove(cart_id).map(|(_, r)| r);
        if removed.is_some() {
            self.announce(cart_id.to_string());
        }
        removed
    }

    fn announce(&self, cart_id: String) {
        // No receivers is fine: nobody is watching.
        let _ = self.inner.feed.send(FeedSignal::Change(ChangeEvent {
            key: Some(cart_id),
        }));
    }

    /// Number of stored carts.
    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    /// Make future `watch` calls succeed or fail.
    pub fn set_feed_supported(&self, supported: bool) {
        self.inner.feed_supported.store(supported, Ordering::SeqCst);
    }

    /// Break every open change feed with the given reason.
    pub fn fail_feeds(&self, reason: &str) {
        let _ = self.inner.feed.send(FeedSignal::Fault(reason.to_string()));
    }

    /// Make `find_by_scope` fail until switched back.
    pub fn set_read_failure(&self, failing: bool) {
        self.inner.read_failure.store(failing, Ordering::SeqCst);
    }

    /// Make reads of one scope hang forever.
    pub fn stall_scope(&self, scope: ScopeId) {
        self.inner.stalled_scopes.insert(scope);
    }

    /// Number of `find_by_scope` calls so far.
    pub fn find_calls(&self) -> usize {
        self.inner.find_calls.load(Ordering::SeqCst)
    }

    /// Number of `watch` calls so far.
    pub fn watch_calls(&self) -> usize {
        self.inner.watch_calls.load(Ordering::SeqCst)
    }

    /// Number of change feed streams currently alive.
    pub fn open_feeds(&self) -> usize {
        self.inner.open_feeds.load(Ordering::SeqCst)
    }
}

impl Default for MemoryCartStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CartStore for MemoryCartStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn find_by_scope(&self, scope: ScopeId) -> Result<Vec<RawCartRecord>> {
        self.inner.find_calls.fetch_add(1, Ordering::SeqCst);

        if self.inner.stalled_scopes.contains(&scope) {
            std::future::pending::<()>().await;
        }
        if self.inner.read_failure.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("read failure injected".to_string()));
        }

        let mut matching: Vec<(String, RawCartRecord)> = self
            .inner
            .records
            .iter()
            .filter(|entry| entry.value().scope() == Some(scope))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        matching.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(matching.into_iter().map(|(_, record)| record).collect())
    }

    async fn watch(&self) -> Result<ChangeStream> {
        self.inner.watch_calls.fetch_add(1, Ordering::SeqCst);

        if !self.inner.feed_supported.load(Ordering::SeqCst) {
            return Err(Error::FeedUnsupported(
                "change feed disabled on this store".to_string(),
            ));
        }

        let rx = self.inner.feed.subscribe();
        let guard = FeedGuard::new(self.inner.open_feeds.clone());

        let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            let item = match rx.recv().await {
                Ok(FeedSignal::Change(event)) => Ok(event),
                Ok(FeedSignal::Fault(reason)) => Err(Error::Feed(reason)),
                // Missed events collapse into one re-read.
                Err(RecvError::Lagged(_)) => Ok(ChangeEvent::default()),
                Err(RecvError::Closed) => return None,
            };
            Some((item, (rx, guard)))
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cart(app: u64, current: u64) -> RawCartRecord {
        RawCartRecord {
            app: json!(app),
            cart_counter: json!(current),
            cart_counter_max: json!(10),
            ..Default::default()
        }
    }

    fn scope(id: u64) -> ScopeId {
        ScopeId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_find_filters_by_scope() {
        let store = MemoryCartStore::new();
        store.upsert("b", cart(5, 2));
        store.upsert("a", cart(5, 1));
        store.upsert("c", cart(7, 3));

        let records = store.find_by_scope(scope(5)).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].cart_counter, json!(1));
        assert!(records.iter().all(|r| r.scope() == Some(scope(5))));
        assert_eq!(store.find_calls(), 1);
    }

    #[tokio::test]
    async fn test_watch_delivers_changes() {
        let store = MemoryCartStore::new();
        let mut feed = store.watch().await.unwrap();
        assert_eq!(store.open_feeds(), 1);

        store.upsert("a", cart(5, 1));
        let event = feed.next().await.unwrap().unwrap();
        assert_eq!(event.key.as_deref(), Some("a"));

        drop(feed);
        assert_eq!(store.open_feeds(), 0);
    }

    #[tokio::test]
    async fn test_watch_unsupported() {
        let store = MemoryCartStore::without_feed();
        let err = store.watch().await.err().unwrap();
        assert!(matches!(err, Error::FeedUnsupported(_)));
        assert_eq!(store.watch_calls(), 1);
        assert_eq!(store.open_feeds(), 0);
    }

    #[tokio::test]
    async fn test_feed_fault() {
        let store = MemoryCartStore::new();
        let mut feed = store.watch().await.unwrap();

        store.fail_feeds("connection reset");
        let item = feed.next().await.unwrap();
        assert!(matches!(item, Err(Error::Feed(_))));
    }

    #[tokio::test]
    async fn test_read_failure_switch() {
        let store = MemoryCartStore::new();
        store.set_read_failure(true);
        assert!(store.find_by_scope(scope(1)).await.is_err());

        store.set_read_failure(false);
        assert!(store.find_by_scope(scope(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_announces() {
        let store = MemoryCartStore::new();
        store.upsert("a", cart(5, 1));
        let mut feed = store.watch().await.unwrap();

        assert!(store.remove("a").is_some());
        assert!(store.remove("a").is_none());
        assert_eq!(feed.next().await.unwrap().unwrap().key.as_deref(), Some("a"));
        assert!(store.is_empty());
    }
}
