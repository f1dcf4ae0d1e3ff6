//! # partscan
//!
//! Camera-driven identification of salvaged components.
//!
//! A live camera feed is scanned continuously by an on-device detector for
//! an advisory overlay. A captured still is normalized and sent to a remote
//! structured-output model that returns a typed component inventory, and an
//! inventory can be matched against a project catalog. Every upstream call
//! is recorded as a cost record for per-user accounting.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ FrameSource  │──▶│  Detection   │──▶ overlay (watch channel)
//! │   (camera)   │   │    loop      │
//! └──────────────┘   └──────────────┘
//!
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   still /    │──▶│  Normalizer  │──▶│   Identify   │──┐
//! │   upload     │   │ resize+JPEG  │   │ cache+remote │  │
//! └──────────────┘   └──────────────┘   └──────────────┘  │
//!                                       ┌──────────────┐  ▼
//!                     inventory ───────▶│   Matcher    │──▶ CostSink
//!                                       └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export PARTSCAN_API_KEY=sk-...
//! partscan normalize photo.jpg --out photo.norm.jpg
//! partscan identify photo.jpg --user alice
//! partscan match --inventory parts.json --projects catalog.json
//! partscan costs ./data/costs.jsonl
//! partscan serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Scan error taxonomy |
//! | [`logging`] | Injected logger capability |
//! | [`normalize`] | Still image normalization |
//! | [`detection`] | Live-frame detection loop |
//! | [`remote`] | Structured-output model transport |
//! | [`cost`] | Cost records and sinks |
//! | [`cache`] | Fingerprint result cache |
//! | [`identify`] | Component identification |
//! | [`matcher`] | Inventory-to-project matching |
//! | [`commands`] | CLI command implementations |
//! | [`server`] | HTTP server |
//!
//! Pure data types, structured-output parsing, fingerprinting and cost
//! aggregation live in the `partscan-core` crate and are re-exported as
//! [`core`].

pub use partscan_core as core;

pub mod cache;
pub mod commands;
pub mod config;
pub mod cost;
pub mod detection;
pub mod error;
pub mod identify;
pub mod logging;
pub mod matcher;
pub mod normalize;
pub mod remote;
pub mod server;
