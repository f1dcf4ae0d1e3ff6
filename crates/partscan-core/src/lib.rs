//! # Partscan Core
//!
//! Runtime-free logic shared by the partscan pipeline: data models,
//! the two-stage structured-output parser, content fingerprints, and
//! cost aggregation.
//!
//! This crate has no tokio, HTTP or image codec dependencies.

pub mod fingerprint;
pub mod ledger;
pub mod models;
pub mod parse;
