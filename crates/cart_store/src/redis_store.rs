//! Redis-backed cart store.
//!
//! Key format: `{prefix}:{app}:{cart_id}`, value is the cart's JSON document.
//! The change feed pattern-subscribes to keyspace notifications for the
//! prefix, which requires `notify-keyspace-events` to be enabled server-side.

use crate::error::{Error, Result};
use crate::{CartStore, ChangeEvent, ChangeStream};
use async_trait::async_trait;
use cart_metrics::{RawCartRecord, ScopeId};
use futures::StreamExt;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default key namespace for cart documents.
pub const DEFAULT_KEY_PREFIX: &str = "cards_status";

/// Whether a `notify-keyspace-events` value publishes keyspace events for
/// string writes and deletes.
pub fn keyspace_events_enabled(flags: &str) -> bool {
    let keyspace = flags.contains('K');
    let classes = flags.chars().any(|c| matches!(c, 'A' | '$' | 'g'));
    keyspace && classes
}

/// Cart store over a shared Redis client.
#[derive(Clone)]
pub struct RedisCartStore {
    client: Arc<redis::Client>,
    key_prefix: String,
}

impl RedisCartStore {
    /// Create a store. Does not connect yet; call [`CartStore::ping`].
    pub fn new(redis_url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            key_prefix: key_prefix.to_string(),
        })
    }

    /// Get an async connection.
    pub async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    /// Key pattern matching every cart of one scope.
    pub fn scope_pattern(&self, scope: ScopeId) -> String {
        format!("{}:{}:*", self.key_prefix, scope)
    }

    /// Keyspace channel pattern for every cart key.
    pub fn keyspace_pattern(&self) -> String {
        format!(
            "__keyspace@{}__:{}:*",
            self.client.get_connection_info().redis.db,
            self.key_prefix
        )
    }

    async fn keyspace_flags(&self) -> Result<String> {
        let mut conn = self.get_connection().await?;
        let reply: Vec<String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg("notify-keyspace-events")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::FeedUnsupported(format!("cannot read keyspace config: {}", e)))?;
        Ok(reply.into_iter().nth(1).unwrap_or_default())
    }
}

#[async_trait]
impl CartStore for RedisCartStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(Error::Unavailable(format!("unexpected PING reply: {}", pong)));
        }
        Ok(())
    }

    async fn find_by_scope(&self, scope: ScopeId) -> Result<Vec<RawCartRecord>> {
        let mut conn = self.get_connection().await?;
        let mut keys: Vec<String> = conn.keys(self.scope_pattern(scope)).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        keys.sort();

        let docs: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::with_capacity(docs.len());
        for (key, doc) in keys.iter().zip(docs) {
            // Deleted between KEYS and MGET.
            let Some(doc) = doc else { continue };

            match serde_json::from_str::<RawCartRecord>(&doc) {
                Ok(record) if record.scope() == Some(scope) => records.push(record),
                Ok(record) => {
                    warn!(
                        "Skipping {}: app {} does not match scope {}",
                        key, record.app, scope
                    );
                }
                Err(e) => warn!("Skipping undecodable cart document {}: {}", key, e),
            }
        }

        debug!("Loaded {} carts for scope {}", records.len(), scope);
        Ok(records)
    }

    async fn watch(&self) -> Result<ChangeStream> {
        let flags = self.keyspace_flags().await?;
        if !keyspace_events_enabled(&flags) {
            return Err(Error::FeedUnsupported(format!(
                "notify-keyspace-events is '{}'",
                flags
            )));
        }

        let pattern = self.keyspace_pattern();
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(&pattern).await?;
        info!("Watching keyspace pattern {}", pattern);

        let channel_prefix = pattern.trim_end_matches('*').to_string();
        let key_prefix = self.key_prefix.clone();
        let stream = pubsub.into_on_message().map(move |msg| {
            let key = msg
                .get_channel_name()
                .strip_prefix(&channel_prefix)
                .map(|rest| format!("{}:{}", key_prefix, rest));
            Ok(ChangeEvent { key })
        });

        Ok(stream.boxed())
    }
}
