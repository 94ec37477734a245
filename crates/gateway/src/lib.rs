//! Gateway service for live cart-occupancy dashboards.
//!
//! This service:
//! - Accepts WebSocket connections from dashboard pages
//! - Tracks which application (scope) each connection listens to
//! - Detects cart changes via the store's change feed, or by polling when
//!   the feed is unavailable
//! - Recomputes and pushes the full dashboard of every affected scope
//!
//! ## Architecture
//!
//! ```text
//! CartStore::watch / poll timer
//!         ↓
//! ChangeSource (push, one-way fallback to pull)
//!         ↓
//! fan-out → ScopeWorkers (one per active scope)
//!         ↓
//! Dispatcher (store → cart_metrics → JSON)
//!         ↓
//! ClientRegistry → WebSocket clients
//! ```
//!
//! With `RESOURCE_MODEL=per_connection` each connection owns its change
//! source instead and only that connection is re-synced on a change.

pub mod change_source;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod lifecycle;
pub mod protocol;
pub mod subscription;
pub mod ws_server;

pub use change_source::{
    ChangeSource, ChangeSourceHandle, ChangeTrigger, SourceSettings, SourceState,
};
pub use client::{ClientId, ClientRegistry, ClientState};
pub use config::{GatewayConfig, ResourceModel, StoreBackend};
pub use dispatcher::Dispatcher;
pub use error::{GatewayError, Result};
pub use lifecycle::{Connection, LiveUpdates};
pub use protocol::{ClientMessage, ServerMessage};
pub use subscription::{SubscribeOutcome, SubscriptionRegistry};
pub use ws_server::{create_router, AppState};
