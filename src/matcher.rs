//! Matching a user's inventory against a project catalog.
//!
//! One remote call per invocation carries the full inventory and catalog in
//! the prompt. This bounds call volume but also bounds how large an
//! inventory or catalog the model can reason over in a single pass; prompts
//! over `matcher.prompt_warn_chars` are logged as exceeding that limit and
//! sent unchanged.
//!
//! # Degraded results
//!
//! Transport and status failures propagate like identification
//! (`RateLimited`, `UpstreamFailure`). A response that cannot be parsed,
//! even after fenced-block extraction, does **not**: the matcher returns an
//! empty list with a diagnostic. A failed match is recoverable by retrying
//! or browsing the catalog by hand, so it must not block the caller.
//!
//! Individual entries that fail to deserialize are dropped with a warning.
//! The result degrades only when every entry is malformed.

use serde::Serialize;
use serde_json::{json, Value};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use partscan_core::models::{Component, CostKind, MatchResult, Project};
use partscan_core::parse::{parse_structured, ParsePath};

use crate::config::MatcherConfig;
use crate::cost::{record_for, CostSink, Pricing};
use crate::error::{Result, ScanError};
use crate::logging::Logger;
use crate::remote::{ModelRequest, StructuredModel};

const COMPONENT: &str = "matcher";

/// Fixed instruction prompt sent with every matching call.
pub const MATCH_INSTRUCTIONS: &str = r#"You match a maker's component inventory against a catalog of build projects.
For each project, decide which required components the inventory already covers.
Respond with JSON only, no prose, exactly in this shape:
{"matched_projects": [{
  "project_id": string,
  "project_name": string,
  "match_score": integer from 0 to 100,
  "components_have": [string],
  "components_missing": [{"name": string, "estimated_cost": number (USD)}],
  "total_missing_cost": number (USD),
  "recommendation": string
}]}
Sort matched_projects by match_score, highest first. Omit projects with no overlap."#;

/// Matcher output. `diagnostic` is set only for degraded results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchOutcome {
    pub matched_projects: Vec<MatchResult>,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    #[serde(skip)]
    pub parse_path: Option<ParsePath>,
}

impl MatchOutcome {
    fn degraded(diagnostic: String) -> Self {
        Self {
            matched_projects: Vec::new(),
            diagnostic: Some(diagnostic),
            parse_path: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.diagnostic.is_some()
    }
}

pub struct ProjectMatcher {
    model: Arc<dyn StructuredModel>,
    costs: Arc<dyn CostSink>,
    pricing: Pricing,
    config: MatcherConfig,
    logger: Arc<dyn Logger>,
}

impl ProjectMatcher {
    pub fn new(
        model: Arc<dyn StructuredModel>,
        costs: Arc<dyn CostSink>,
        pricing: Pricing,
        config: MatcherConfig,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            model,
            costs,
            pricing,
            config,
            logger,
        }
    }

    /// Match `inventory` against `projects`. `None` means the caller omitted
    /// the collection, which is a validation error; empty collections are fine.
    pub async fn match_projects(
        &self,
        user_id: &str,
        inventory: Option<&[Component]>,
        projects: Option<&[Project]>,
    ) -> Result<MatchOutcome> {
        let (inventory, projects) = match (inventory, projects) {
            (Some(i), Some(p)) => (i, p),
            _ => {
                return Err(ScanError::Validation(
                    "inventory and projects are required".to_string(),
                ))
            }
        };
        if !self.model.is_configured() {
            return Err(ScanError::Misconfigured(
                "model credential is not configured".to_string(),
            ));
        }

        let prompt = build_prompt(inventory, projects);
        if prompt.len() > self.config.prompt_warn_chars {
            self.logger.warn(
                COMPONENT,
                &format!(
                    "prompt is {} chars ({} components, {} projects); single-pass matching may lose detail",
                    prompt.len(),
                    inventory.len(),
                    projects.len()
                ),
            );
        }

        let request = ModelRequest {
            instructions: MATCH_INSTRUCTIONS.to_string(),
            prompt,
            image_data_url: None,
        };
        let reply = self.model.call(&request).await?;

        self.costs.append(record_for(
            user_id,
            None,
            CostKind::Match,
            reply.usage,
            self.pricing,
        ))
        .await;

        if reply.status == 429 {
            self.logger.warn(COMPONENT, "match rate limited upstream");
            return Err(ScanError::rate_limited(&reply.body));
        }
        if !reply.is_success() {
            self.logger.error(
                COMPONENT,
                &format!("match failed upstream with HTTP {}", reply.status),
            );
            return Err(ScanError::upstream(Some(reply.status), &reply.body));
        }

        let (value, parse_path) = match parse_structured(&reply.body).into_value() {
            Ok(parsed) => parsed,
            Err(reason) => return Ok(self.degrade(reason)),
        };
        let mut matched = match self.results_from_value(value) {
            Ok(results) => results,
            Err(reason) => return Ok(self.degrade(reason)),
        };

        if self.config.resort {
            resort_by_score(&mut matched, projects);
        }

        self.logger.info(
            COMPONENT,
            &format!(
                "matched {} project(s) out of {} via {:?} parse",
                matched.len(),
                projects.len(),
                parse_path
            ),
        );

        Ok(MatchOutcome {
            matched_projects: matched,
            diagnostic: None,
            parse_path: Some(parse_path),
        })
    }

    fn degrade(&self, reason: String) -> MatchOutcome {
        self.logger.warn(
            COMPONENT,
            &format!("returning empty match result: {}", reason),
        );
        MatchOutcome::degraded(format!("Could not parse match response: {}", reason))
    }

    /// Accepts `{"matched_projects": [...]}` or a bare array. Malformed
    /// entries are skipped; `Err` only when there were entries and none parsed.
    fn results_from_value(
        &self,
        value: Value,
    ) -> std::result::Result<Vec<MatchResult>, String> {
        let entries = match value {
            Value::Object(mut map) => match map.remove("matched_projects") {
                Some(Value::Array(entries)) => entries,
                _ => return Err("missing `matched_projects` array".to_string()),
            },
            Value::Array(entries) => entries,
            _ => return Err("expected a JSON object or array".to_string()),
        };

        let mut results = Vec::with_capacity(entries.len());
        let mut last_error = None;
        for (idx, entry) in entries.into_iter().enumerate() {
            match serde_json::from_value::<MatchResult>(entry) {
                Ok(mut result) => {
                    result.match_score = result.match_score.clamp(0, 100);
                    results.push(result);
                }
                Err(e) => {
                    self.logger
                        .warn(COMPONENT, &format!("dropping match entry {}: {}", idx, e));
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if results.is_empty() => Err(format!("unexpected match shape: {}", e)),
            _ => Ok(results),
        }
    }
}

/// Highest score first. Ties follow catalog order; ids not in the catalog
/// sort after every known project.
fn resort_by_score(matched: &mut [MatchResult], projects: &[Project]) {
    let position: HashMap<&str, usize> = projects
        .iter()
        .enumerate()
        .map(|(idx, p)| (p.id.as_str(), idx))
        .collect();
    matched.sort_by_key(|m| {
        (
            Reverse(m.match_score),
            position
                .get(m.project_id.as_str())
                .copied()
                .unwrap_or(usize::MAX),
        )
    });
}

/// Serialize inventory and catalog into the per-call prompt.
pub fn build_prompt(inventory: &[Component], projects: &[Project]) -> String {
    let payload = json!({
        "inventory": inventory,
        "projects": projects,
    });
    format!(
        "Inventory and project catalog:\n{}",
        serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string())
    )
}
