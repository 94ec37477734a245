//! Cart occupancy schema definitions.
//!
//! `RawCartRecord` mirrors one stored document as-is (unknown fields are kept
//! so they can be echoed back in the raw-data feed). `CartView`, `ZoneMetric`
//! and `DashboardPayload` are derived on every dispatch and never stored.

use crate::color::DEFAULT_COLOR;
use crate::transform::{compute_cart_views, compute_zone_metrics};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// Scope
// ============================================================================

/// Application id partitioning all records and subscriptions.
///
/// Always strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ScopeId(u64);

impl ScopeId {
    /// Create a scope id, rejecting zero.
    pub fn new(id: u64) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Parse a client-supplied scope the way the dashboard page sends it.
    ///
    /// Numbers are truncated toward zero; strings contribute their leading
    /// decimal digits after optional whitespace (`" 15abc"` is scope 15).
    /// Anything that does not yield a positive integer is rejected.
    pub fn parse(raw: &Value) -> Option<Self> {
        match raw {
            Value::Number(n) => {
                if let Some(id) = n.as_u64() {
                    return Self::new(id);
                }
                let f = n.as_f64()?;
                if f.is_finite() && f >= 1.0 && f < u64::MAX as f64 {
                    Self::new(f.trunc() as u64)
                } else {
                    None
                }
            }
            Value::String(s) => {
                let s = s.trim_start();
                let s = s.strip_prefix('+').unwrap_or(s);
                let digits: &str = {
                    let end = s
                        .char_indices()
                        .find(|(_, c)| !c.is_ascii_digit())
                        .map(|(i, _)| i)
                        .unwrap_or(s.len());
                    &s[..end]
                };
                digits.parse::<u64>().ok().and_then(Self::new)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Raw records
// ============================================================================

/// Accept a zone label stored either as text or as a bare number.
fn optional_label<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Coerce a loosely typed stored value to a number; anything unusable is 0.
fn numeric(value: &Value) -> f64 {
    let n = match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                0.0
            } else {
                s.parse::<f64>().unwrap_or(0.0)
            }
        }
        Value::Bool(true) => 1.0,
        _ => 0.0,
    };
    if n.is_finite() {
        n
    } else {
        0.0
    }
}

/// One tracked cart as stored by the external store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawCartRecord {
    /// Owning application id.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub app: Value,
    /// Zone / location label.
    #[serde(
        default,
        deserialize_with = "optional_label",
        skip_serializing_if = "Option::is_none"
    )]
    pub zone: Option<String>,
    /// Current number of carts.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub cart_counter: Value,
    /// Capacity.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub cart_counter_max: Value,
    /// Assigned status color (hex code or English name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Map coordinates, kept as stored (number or string).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub lat: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub lng: Value,
    /// Every other stored field, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RawCartRecord {
    /// Scope this record belongs to, if `app` is a positive integer.
    pub fn scope(&self) -> Option<ScopeId> {
        self.app.as_u64().and_then(ScopeId::new)
    }

    /// Current count, never negative.
    pub fn current(&self) -> f64 {
        numeric(&self.cart_counter).max(0.0)
    }

    /// Capacity floored at 1 so the fill ratio is always defined.
    pub fn capacity(&self) -> f64 {
        numeric(&self.cart_counter_max).max(1.0)
    }

    /// Color used for ranking and display.
    pub fn color_or_default(&self) -> &str {
        self.color.as_deref().unwrap_or(DEFAULT_COLOR)
    }
}

// ============================================================================
// Derived views
// ============================================================================

/// A raw record plus its fill percentage, with the display color resolved.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CartView {
    #[serde(flatten)]
    pub record: RawCartRecord,
    /// `round(current / capacity * 100)`.
    pub percentage: u64,
}

impl CartView {
    /// Resolved color (never empty after transform).
    pub fn color(&self) -> &str {
        self.record.color_or_default()
    }
}

/// Status tag rendered as the summary card's CSS modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneStatus {
    Ok,
    Low,
    Critical,
}

/// Value shown on a summary card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricValue {
    /// Plain count, rendered as a JSON number.
    Count(u64),
    /// Percentage, rendered as `"NN%"`.
    Percent(u64),
}

impl Serialize for MetricValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MetricValue::Count(n) => serializer.serialize_u64(*n),
            MetricValue::Percent(p) => serializer.serialize_str(&format!("{}%", p)),
        }
    }
}

/// One summary card row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneMetric {
    /// Display label.
    pub name: String,
    #[serde(rename = "carts")]
    pub value: MetricValue,
    pub status: ZoneStatus,
    /// Caption under the value.
    #[serde(rename = "footer_card")]
    pub footer: String,
}

/// Full-state message pushed to a dashboard on every dispatch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardPayload {
    pub zones: [ZoneMetric; 4],
    pub cart_details: Vec<CartView>,
    pub raw_data: Vec<RawCartRecord>,
}

impl DashboardPayload {
    /// Run the metrics transform over a freshly fetched record set.
    pub fn from_records(raw_data: Vec<RawCartRecord>) -> Self {
        let cart_details = compute_cart_views(&raw_data);
        let zones = compute_zone_metrics(&cart_details);
        Self {
            zones,
            cart_details,
            raw_data,
        }
    }
}
