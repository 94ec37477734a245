//! Status color classification.
//!
//! Carts are colored by the upstream sensor pipeline, which has used both
//! Bootstrap/Flat UI hex codes and plain English names over time. Matching is
//! a case-insensitive substring test against a fixed token set.

/// Color assigned to records stored without one.
pub const DEFAULT_COLOR: &str = "#999";

const RED_TOKENS: &[&str] = &["dc3545", "e74c3c", "red"];
const ORANGE_TOKENS: &[&str] = &["fd7e14", "f1c40f", "orange"];
const GREEN_TOKENS: &[&str] = &["28a745", "green"];

/// Ranking class of a status color. Declaration order is the ranking order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ColorClass {
    Red,
    Orange,
    Green,
    Other,
}

impl ColorClass {
    /// Classify a color string.
    pub fn classify(color: &str) -> Self {
        let c = color.to_ascii_lowercase();
        let has_any = |tokens: &[&str]| tokens.iter().any(|t| c.contains(t));

        if has_any(RED_TOKENS) {
            ColorClass::Red
        } else if has_any(ORANGE_TOKENS) {
            ColorClass::Orange
        } else if has_any(GREEN_TOKENS) {
            ColorClass::Green
        } else {
            ColorClass::Other
        }
    }
}
