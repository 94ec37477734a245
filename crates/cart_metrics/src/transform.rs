//! Raw records → ranked cart views → summary cards.
//!
//! Pure functions, recomputed from scratch on every dispatch.

use crate::color::{ColorClass, DEFAULT_COLOR};
use crate::schema::{CartView, MetricValue, RawCartRecord, ZoneMetric, ZoneStatus};
use std::cmp::Ordering;

/// Carts at or below this fill percentage count as critical.
pub const CRITICAL_FILL_PERCENT: u64 = 20;

/// Carts at or above this fill percentage count as complete.
pub const COMPLETE_FILL_PERCENT: u64 = 80;

/// Average fill below this is flagged `low`.
pub const LOW_AVERAGE_PERCENT: u64 = 30;

/// Fill percentage of a record, `round(current / capacity * 100)`.
pub fn fill_percentage(record: &RawCartRecord) -> u64 {
    (record.current() / record.capacity() * 100.0).round() as u64
}

/// Dashboard ordering: color class first, then ascending fill.
pub fn cart_view_order(a: &CartView, b: &CartView) -> Ordering {
    ColorClass::classify(a.color())
        .cmp(&ColorClass::classify(b.color()))
        .then(a.percentage.cmp(&b.percentage))
}

/// Build ranked cart views. Input records are cloned, never modified.
pub fn compute_cart_views(records: &[RawCartRecord]) -> Vec<CartView> {
    let mut views: Vec<CartView> = records
        .iter()
        .map(|record| {
            let mut record = record.clone();
            let percentage = fill_percentage(&record);
            // A stored `percentage` would collide with the computed one.
            record.extra.remove("percentage");
            if record.color.is_none() {
                record.color = Some(DEFAULT_COLOR.to_string());
            }
            CartView { record, percentage }
        })
        .collect();

    // Stable, so equal-ranked carts keep store order.
    views.sort_by(cart_view_order);
    views
}

/// Build the four summary rows: total, average fill, critical, complete.
pub fn compute_zone_metrics(views: &[CartView]) -> [ZoneMetric; 4] {
    let total: f64 = views.iter().map(|v| v.record.current()).sum();
    let critical = views
        .iter()
        .filter(|v| v.percentage <= CRITICAL_FILL_PERCENT)
        .count() as u64;
    let complete = views
        .iter()
        .filter(|v| v.percentage >= COMPLETE_FILL_PERCENT)
        .count() as u64;
    let average = if views.is_empty() {
        0
    } else {
        let sum: f64 = views.iter().map(|v| v.percentage as f64).sum();
        (sum / views.len() as f64).round() as u64
    };

    [
        ZoneMetric {
            name: "Total Carts".to_string(),
            value: MetricValue::Count(total.round() as u64),
            status: ZoneStatus::Ok,
            footer: "Detected in real time".to_string(),
        },
        ZoneMetric {
            name: "Average Fill".to_string(),
            value: MetricValue::Percent(average),
            status: if average < LOW_AVERAGE_PERCENT {
                ZoneStatus::Low
            } else {
                ZoneStatus::Ok
            },
            footer: "Overall average".to_string(),
        },
        ZoneMetric {
            name: "Critical Zones".to_string(),
            value: MetricValue::Count(critical),
            status: ZoneStatus::Critical,
            footer: format!("Low level (<{}%)", CRITICAL_FILL_PERCENT),
        },
        ZoneMetric {
            name: "Complete Zones".to_string(),
            value: MetricValue::Count(complete),
            status: ZoneStatus::Ok,
            footer: format!("High level (>{}%)", COMPLETE_FILL_PERCENT),
        },
    ]
}
