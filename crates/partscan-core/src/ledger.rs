//! Cost aggregation over append-only cost records.
//!
//! [`summarize`] is a pure function of its input snapshot: it groups records
//! by user, sums cost, counts scans and corrections, and keeps the latest
//! timestamp. Records that arrive while a summary is being built are simply
//! not part of that snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::models::{CostKind, CostRecord, UserCostSummary};

/// Per-user summaries plus platform totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSummary {
    /// One entry per distinct `user_id`, ordered by `user_id`.
    pub users: Vec<UserCostSummary>,
    pub platform_total: f64,
    /// `platform_total / record_count`, or `0.0` with no records.
    pub average_cost_per_scan: f64,
    pub record_count: usize,
}

/// Summarize records using the user id as display name.
pub fn summarize(records: &[CostRecord]) -> LedgerSummary {
    summarize_with_names(records, &HashMap::new())
}

/// Summarize records, resolving display names from `names` where present.
pub fn summarize_with_names(
    records: &[CostRecord],
    names: &HashMap<String, String>,
) -> LedgerSummary {
    let mut by_user: BTreeMap<&str, UserCostSummary> = BTreeMap::new();
    let mut platform_total = 0.0;

    for record in records {
        platform_total += record.cost;

        let entry = by_user
            .entry(record.user_id.as_str())
            .or_insert_with(|| UserCostSummary {
                user_id: record.user_id.clone(),
                display_name: names
                    .get(&record.user_id)
                    .cloned()
                    .unwrap_or_else(|| record.user_id.clone()),
                total_scans: 0,
                total_corrections: 0,
                total_cost: 0.0,
                last_scan_at: None,
            });

        entry.total_cost += record.cost;
        match record.kind {
            CostKind::Scan => entry.total_scans += 1,
            CostKind::Correction => entry.total_corrections += 1,
            CostKind::Match => {}
        }
        entry.last_scan_at = Some(latest(entry.last_scan_at, record.timestamp));
    }

    let record_count = records.len();
    let average_cost_per_scan = if record_count > 0 {
        platform_total / record_count as f64
    } else {
        0.0
    };

    LedgerSummary {
        users: by_user.into_values().collect(),
        platform_total,
        average_cost_per_scan,
        record_count,
    }
}

fn latest(current: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> DateTime<Utc> {
    match current {
        Some(ts) if ts >= candidate => ts,
        _ => candidate,
    }
}
