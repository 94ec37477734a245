//! Read-only access to cart records and their change feed.
//!
//! The gateway only ever reads: records are written by the sensor pipeline.
//! Two backends implement [`CartStore`]:
//! - [`RedisCartStore`]: one JSON document per cart, change feed built on
//!   Redis keyspace notifications
//! - [`MemoryCartStore`]: in-process store for local runs and tests
//!
//! # Example
//!
//! ```ignore
//! use cart_store::{CartStore, RedisCartStore};
//!
//! let store = RedisCartStore::new("redis://localhost:6379", "cards_status")?;
//! store.ping().await?;
//! let records = store.find_by_scope(scope).await?;
//! let mut feed = store.watch().await?;
//! ```

pub mod error;
pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use cart_metrics::{RawCartRecord, ScopeId};
use futures::stream::BoxStream;

pub use error::{Error, Result};
pub use memory::MemoryCartStore;
pub use redis_store::{keyspace_events_enabled, RedisCartStore, DEFAULT_KEY_PREFIX};

/// Signal that stored records changed. Carries no payload the gateway relies
/// on: receivers re-read current state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeEvent {
    /// Key that changed, when the backend reports one.
    pub key: Option<String>,
}

/// Live change feed. `Some(Err(_))` or the end of the stream means the feed
/// is broken and must not be read again.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent>>;

/// Store contract consumed by the gateway.
#[async_trait]
pub trait CartStore: Send + Sync + 'static {
    /// Check the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// All records of one application, and only those.
    async fn find_by_scope(&self, scope: ScopeId) -> Result<Vec<RawCartRecord>>;

    /// Open a change feed over the whole record set.
    ///
    /// Fails with [`Error::FeedUnsupported`] when the backend has no feed.
    async fn watch(&self) -> Result<ChangeStream>;
}
