//! Core data models that flow through the scan pipeline.
//!
//! Wire-facing types use `snake_case` field names, matching the JSON shape
//! the remote model is instructed to produce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Axis-aligned box in source-image pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A single live-frame detection. Ephemeral: replaced every loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}

/// A resized, re-encoded still ready to be sent upstream.
///
/// Immutable once produced. `fingerprint` is a pure function of `bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub fingerprint: String,
}

impl NormalizedImage {
    /// MIME type of the encoded payload.
    pub const MEDIA_TYPE: &'static str = "image/jpeg";
}

/// Structured description of one component identified in a still.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifiedItem {
    pub component_name: String,
    #[serde(default = "unknown")]
    pub category: String,
    #[serde(default = "unknown")]
    pub condition: String,
    #[serde(default)]
    pub specifications: BTreeMap<String, serde_json::Value>,
    /// 0 (scrap) to 10 (ready to reuse).
    #[serde(default)]
    pub reusability_score: f64,
    #[serde(default)]
    pub market_value_low: f64,
    #[serde(default)]
    pub market_value_high: f64,
    #[serde(default)]
    pub confidence: f64,
}

fn unknown() -> String {
    "unknown".to_string()
}

/// An inventory entry offered to the project matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default = "one")]
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

fn one() -> u32 {
    1
}

/// A catalog project the matcher can recommend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required_components: Vec<RequiredComponent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredComponent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
}

/// A component the user lacks for a given project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingComponent {
    pub name: String,
    #[serde(default)]
    pub estimated_cost: f64,
}

/// How well the user's inventory covers one catalog project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub project_id: String,
    #[serde(default)]
    pub project_name: String,
    /// Clamped to `0..=100` after parsing. Fractional scores are rounded.
    #[serde(default, deserialize_with = "rounded_score")]
    pub match_score: i64,
    /// Distinct names, sorted.
    #[serde(default)]
    pub components_have: BTreeSet<String>,
    #[serde(default)]
    pub components_missing: Vec<MissingComponent>,
    #[serde(default)]
    pub total_missing_cost: f64,
    #[serde(default)]
    pub recommendation: String,
}

fn rounded_score<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let score = f64::deserialize(deserializer)?;
    Ok(if score.is_finite() { score.round() as i64 } else { 0 })
}

/// What a cost record paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostKind {
    Scan,
    Correction,
    Match,
}

/// One upstream call's cost. Append-only; the ledger never mutates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<String>,
    pub kind: CostKind,
    pub cost: f64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    pub timestamp: DateTime<Utc>,
}

/// Per-user view derived from cost records. Never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserCostSummary {
    pub user_id: String,
    pub display_name: String,
    pub total_scans: u64,
    pub total_corrections: u64,
    pub total_cost: f64,
    pub last_scan_at: Option<DateTime<Utc>>,
}
