//! CLI command implementations.
//!
//! Each `run_*` function backs one `partscan` subcommand and prints to
//! stdout. The HTTP server exposes the same pipeline through
//! [`crate::server`].

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use partscan_core::ledger::{summarize_with_names, LedgerSummary};
use partscan_core::models::{Component, Project};

use crate::cache::FingerprintCache;
use crate::config::Config;
use crate::cost::{read_cost_records, Pricing};
use crate::identify::{Identification, IdentificationOrchestrator};
use crate::logging::TracingLogger;
use crate::matcher::{MatchOutcome, ProjectMatcher};
use crate::normalize::ImageNormalizer;
use crate::remote::HttpModel;
use crate::server::cost_sink;

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read image: {}", path.display()))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// Normalize one image and optionally write the JPEG to `out`.
pub fn run_normalize(config: &Config, image: &Path, out: Option<&Path>) -> Result<()> {
    let raw = read_image(image)?;
    let normalized = ImageNormalizer::new(&config.normalize).normalize(&raw)?;

    println!("fingerprint: {}", normalized.fingerprint);
    println!("dimensions:  {}x{}", normalized.width, normalized.height);
    println!("bytes:       {}", normalized.bytes.len());

    if let Some(out) = out {
        std::fs::write(out, &normalized.bytes)
            .with_context(|| format!("Failed to write {}", out.display()))?;
        println!("written:     {}", out.display());
    }
    Ok(())
}

/// Normalize and identify one image against the configured model.
pub async fn identify_file(config: &Config, image: &Path, user: &str) -> Result<Identification> {
    let raw = read_image(image)?;
    let normalized = ImageNormalizer::new(&config.normalize).normalize(&raw)?;

    let orchestrator = IdentificationOrchestrator::new(
        Arc::new(HttpModel::new(&config.model)?),
        cost_sink(config),
        Arc::new(FingerprintCache::new(config.cache.capacity)),
        Pricing::from(&config.model),
        Arc::new(TracingLogger),
    );
    Ok(orchestrator.identify(user, &normalized).await?)
}

pub async fn run_identify(config: &Config, image: &Path, user: &str) -> Result<()> {
    let identification = identify_file(config, image, user).await?;

    println!("scan_id:     {}", identification.scan_id);
    println!("fingerprint: {}", identification.fingerprint);
    println!("items:       {}", identification.items.len());
    println!();
    for item in &identification.items {
        println!(
            "  {} [{} / {}] reuse {:.1}/10, ${:.2}-${:.2}, confidence {:.2}",
            item.component_name,
            item.category,
            item.condition,
            item.reusability_score,
            item.market_value_low,
            item.market_value_high,
            item.confidence
        );
        for (key, value) in &item.specifications {
            println!("      {}: {}", key, value);
        }
    }
    Ok(())
}

/// Match an inventory file against a project catalog file.
pub async fn match_files(
    config: &Config,
    inventory: &Path,
    projects: &Path,
    user: &str,
) -> Result<MatchOutcome> {
    let inventory: Vec<Component> = read_json(inventory)?;
    let projects: Vec<Project> = read_json(projects)?;

    let matcher = ProjectMatcher::new(
        Arc::new(HttpModel::new(&config.model)?),
        cost_sink(config),
        Pricing::from(&config.model),
        config.matcher.clone(),
        Arc::new(TracingLogger),
    );
    Ok(matcher
        .match_projects(user, Some(inventory.as_slice()), Some(projects.as_slice()))
        .await?)
}

pub async fn run_match(config: &Config, inventory: &Path, projects: &Path, user: &str) -> Result<()> {
    let outcome = match_files(config, inventory, projects, user).await?;

    if let Some(diagnostic) = &outcome.diagnostic {
        eprintln!("warning: {}", diagnostic);
    }
    if outcome.matched_projects.is_empty() {
        println!("No matching projects.");
        return Ok(());
    }

    for (i, m) in outcome.matched_projects.iter().enumerate() {
        println!("{}. {} ({}) score {}", i + 1, m.project_name, m.project_id, m.match_score);
        println!("   have:    {}", m.components_have.iter().cloned().collect::<Vec<_>>().join(", "));
        if !m.components_missing.is_empty() {
            let missing: Vec<String> = m
                .components_missing
                .iter()
                .map(|c| format!("{} (${:.2})", c.name, c.estimated_cost))
                .collect();
            println!("   missing: {}", missing.join(", "));
        }
        println!("   missing cost: ${:.2}", m.total_missing_cost);
        println!("   {}", m.recommendation);
        println!();
    }
    Ok(())
}

/// Summarize a JSON Lines cost log. `names` is an optional JSON object
/// mapping user ids to display names.
pub fn summarize_file(records: &Path, names: Option<&Path>) -> Result<LedgerSummary> {
    let records = read_cost_records(records)?;
    let names: HashMap<String, String> = match names {
        Some(path) => read_json(path)?,
        None => HashMap::new(),
    };
    Ok(summarize_with_names(&records, &names))
}

pub fn run_costs(records: &Path, names: Option<&Path>) -> Result<()> {
    let summary = summarize_file(records, names)?;

    println!(
        "{:<24} {:>7} {:>11} {:>12}  last activity",
        "user", "scans", "corrections", "cost (USD)"
    );
    for user in &summary.users {
        let last = user
            .last_scan_at
            .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:>7} {:>11} {:>12.6}  {}",
            user.display_name, user.total_scans, user.total_corrections, user.total_cost, last
        );
    }
    println!();
    println!("records:          {}", summary.record_count);
    println!("platform total:   ${:.6}", summary.platform_total);
    println!("average per scan: ${:.6}", summary.average_cost_per_scan);
    Ok(())
}
