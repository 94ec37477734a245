//! Cart occupancy schema and derived dashboard metrics.
//!
//! Everything here is pure: records come in, views and summary rows come
//! out. No I/O and no caching, so the gateway can recompute the whole
//! dashboard on every change signal.
//!
//! ```text
//! RawCartRecord[] --compute_cart_views--> CartView[] (ranked)
//!                                            |
//!                               compute_zone_metrics
//!                                            v
//!                                     ZoneMetric[4]
//! ```

pub mod color;
pub mod schema;
pub mod transform;

pub use color::{ColorClass, DEFAULT_COLOR};
pub use schema::{
    CartView, DashboardPayload, MetricValue, RawCartRecord, ScopeId, ZoneMetric, ZoneStatus,
};
pub use transform::{
    cart_view_order, compute_cart_views, compute_zone_metrics, fill_percentage,
    COMPLETE_FILL_PERCENT, CRITICAL_FILL_PERCENT, LOW_AVERAGE_PERCENT,
};
