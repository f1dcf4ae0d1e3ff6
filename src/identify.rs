//! Identification of a captured still via a remote structured-output model.
//!
//! [`IdentificationOrchestrator::identify`] takes a [`NormalizedImage`],
//! asks the model for a fixed JSON shape, and returns the parsed items.
//!
//! # Failure handling
//!
//! | Situation | Result | Cost record |
//! |-----------|--------|-------------|
//! | empty user id / image | `Validation` | no |
//! | credential missing | `Misconfigured` | no |
//! | fingerprint cached | cached items | no |
//! | transport failure | `UpstreamFailure { status: None }` | no |
//! | HTTP 429 | `RateLimited` | yes |
//! | other non-2xx | `UpstreamFailure` | yes |
//! | 2xx, unparsable | `Parse` | yes |
//! | 2xx, parsed | items | yes |
//!
//! Unlike project matching, a parse failure here is a hard error.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use partscan_core::models::{CostKind, IdentifiedItem, NormalizedImage};
use partscan_core::parse::{parse_structured, ParsePath};

use crate::cache::FingerprintCache;
use crate::cost::{record_for, CostSink, Pricing};
use crate::error::{Result, ScanError};
use crate::logging::Logger;
use crate::normalize::to_data_url;
use crate::remote::{ModelRequest, StructuredModel};

const COMPONENT: &str = "identify";

/// Fixed instruction prompt sent with every identification call.
pub const IDENTIFY_INSTRUCTIONS: &str = r#"You identify salvaged electronic and mechanical components from a photo.
Respond with JSON only, no prose, exactly in this shape:
{"items": [{
  "component_name": string,
  "category": string,
  "condition": "new" | "good" | "fair" | "poor" | "broken",
  "specifications": {string: string | number},
  "reusability_score": number from 0 to 10,
  "market_value_low": number (USD),
  "market_value_high": number (USD),
  "confidence": number from 0 to 1
}]}
List every distinct component you can see. Use an empty items array if none are recognizable."#;

/// Outcome of a successful identification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identification {
    pub scan_id: String,
    pub fingerprint: String,
    pub items: Vec<IdentifiedItem>,
    /// `None` when served from cache.
    pub parse_path: Option<ParsePath>,
    pub cached: bool,
}

pub struct IdentificationOrchestrator {
    model: Arc<dyn StructuredModel>,
    costs: Arc<dyn CostSink>,
    cache: Arc<FingerprintCache>,
    pricing: Pricing,
    logger: Arc<dyn Logger>,
}

impl IdentificationOrchestrator {
    pub fn new(
        model: Arc<dyn StructuredModel>,
        costs: Arc<dyn CostSink>,
        cache: Arc<FingerprintCache>,
        pricing: Pricing,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            model,
            costs,
            cache,
            pricing,
            logger,
        }
    }

    /// Identify the components in `image` on behalf of `user_id`.
    pub async fn identify(&self, user_id: &str, image: &NormalizedImage) -> Result<Identification> {
        if user_id.trim().is_empty() {
            return Err(ScanError::Validation("user_id must not be empty".to_string()));
        }
        if image.bytes.is_empty() || image.fingerprint.is_empty() {
            return Err(ScanError::Validation(
                "image must be normalized before identification".to_string(),
            ));
        }
        if !self.model.is_configured() {
            return Err(ScanError::Misconfigured(
                "model credential is not configured".to_string(),
            ));
        }

        let scan_id = Uuid::new_v4().to_string();

        if let Some(items) = self.cache.get(&image.fingerprint) {
            self.logger.debug(
                COMPONENT,
                &format!("cache hit for fingerprint {}", image.fingerprint),
            );
            return Ok(Identification {
                scan_id,
                fingerprint: image.fingerprint.clone(),
                items,
                parse_path: None,
                cached: true,
            });
        }

        let request = ModelRequest {
            instructions: IDENTIFY_INSTRUCTIONS.to_string(),
            prompt: String::new(),
            image_data_url: Some(to_data_url(image)),
        };

        let reply = match self.model.call(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                self.logger
                    .warn(COMPONENT, &format!("scan {} never reached upstream: {}", scan_id, e));
                return Err(e);
            }
        };

        self.costs.append(record_for(
            user_id,
            Some(&scan_id),
            CostKind::Scan,
            reply.usage,
            self.pricing,
        ))
        .await;

        if reply.status == 429 {
            self.logger
                .warn(COMPONENT, &format!("scan {} rate limited upstream", scan_id));
            return Err(ScanError::rate_limited(&reply.body));
        }
        if !reply.is_success() {
            self.logger.error(
                COMPONENT,
                &format!("scan {} failed upstream with HTTP {}", scan_id, reply.status),
            );
            return Err(ScanError::upstream(Some(reply.status), &reply.body));
        }

        let (value, parse_path) = parse_structured(&reply.body)
            .into_value()
            .map_err(ScanError::Parse)?;
        let items = self.items_from_value(value)?;

        if !items.is_empty() {
            self.cache.insert(&image.fingerprint, items.clone());
        }
        self.logger.info(
            COMPONENT,
            &format!(
                "scan {} identified {} item(s) via {:?} parse",
                scan_id,
                items.len(),
                parse_path
            ),
        );

        Ok(Identification {
            scan_id,
            fingerprint: image.fingerprint.clone(),
            items,
            parse_path: Some(parse_path),
            cached: false,
        })
    }

    /// Accept `{"items": [...]}`, a bare array, or a single item object.
    /// Entries that do not deserialize are dropped; if every entry is
    /// dropped the response is a parse error.
    fn items_from_value(&self, value: Value) -> Result<Vec<IdentifiedItem>> {
        let entries = match value {
            Value::Object(mut map) => match map.remove("items") {
                Some(Value::Array(items)) => items,
                Some(_) => return Err(ScanError::Parse("`items` must be an array".to_string())),
                None => vec![Value::Object(map)],
            },
            Value::Array(items) => items,
            _ => {
                return Err(ScanError::Parse(
                    "expected a JSON object or array".to_string(),
                ))
            }
        };

        let total = entries.len();
        let items: Vec<IdentifiedItem> = entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<IdentifiedItem>(entry) {
                Ok(item) => sanitize(item),
                Err(e) => {
                    self.logger
                        .warn(COMPONENT, &format!("dropping malformed item: {}", e));
                    None
                }
            })
            .collect();

        if total > 0 && items.is_empty() {
            return Err(ScanError::Parse(format!(
                "none of the {} returned item(s) had a usable shape",
                total
            )));
        }
        Ok(items)
    }
}

fn sanitize(mut item: IdentifiedItem) -> Option<IdentifiedItem> {
    item.component_name = item.component_name.trim().to_string();
    if item.component_name.is_empty() {
        return None;
    }
    item.confidence = clamp_finite(item.confidence, 0.0, 1.0);
    item.reusability_score = clamp_finite(item.reusability_score, 0.0, 10.0);
    item.market_value_low = clamp_finite(item.market_value_low, 0.0, f64::MAX);
    item.market_value_high = clamp_finite(item.market_value_high, 0.0, f64::MAX);
    if item.market_value_low > item.market_value_high {
        std::mem::swap(&mut item.market_value_low, &mut item.market_value_high);
    }
    Some(item)
}

fn clamp_finite(value: f64, min: f64, max: f64) -> f64 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::MemoryCostLog;
    use crate::logging::NoopLogger;
    use crate::remote::{ModelReply, Usage};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Returns scripted replies in order and counts calls.
    struct ScriptedModel {
        configured: bool,
        replies: Mutex<Vec<Result<ModelReply>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<ModelReply>>) -> Arc<Self> {
            Arc::new(Self {
                configured: true,
                replies: Mutex::new(replies),
                calls: Mutex::new(0),
            })
        }

        fn unconfigured() -> Arc<Self> {
            Arc::new(Self {
                configured: false,
                replies: Mutex::new(Vec::new()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl StructuredModel for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn is_configured(&self) -> bool {
            self.configured
        }
        async fn call(&self, _request: &ModelRequest) -> Result<ModelReply> {
            *self.calls.lock().unwrap() += 1;
            self.replies.lock().unwrap().remove(0)
        }
    }

    fn ok(body: &str) -> Result<ModelReply> {
        Ok(ModelReply {
            status: 200,
            body: body.to_string(),
            usage: Some(Usage {
                input_tokens: 1_000,
                output_tokens: 100,
            }),
        })
    }

    fn status(code: u16, body: &str) -> Result<ModelReply> {
        Ok(ModelReply {
            status: code,
            body: body.to_string(),
            usage: None,
        })
    }

    fn image(fingerprint: &str) -> NormalizedImage {
        NormalizedImage {
            bytes: vec![0xFF, 0xD8, 0xFF, 0xD9],
            width: 1,
            height: 1,
            fingerprint: fingerprint.to_string(),
        }
    }

    fn orchestrator(
        model: Arc<ScriptedModel>,
    ) -> (IdentificationOrchestrator, Arc<MemoryCostLog>) {
        let costs = Arc::new(MemoryCostLog::new());
        let orch = IdentificationOrchestrator::new(
            model,
            costs.clone(),
            Arc::new(FingerprintCache::new(8)),
            Pricing {
                input_per_mtok: 1.0,
                output_per_mtok: 10.0,
            },
            Arc::new(NoopLogger),
        );
        (orch, costs)
    }

    const RELAY: &str = r#"{"items":[{"component_name":"5V relay","category":"electromechanical","condition":"good","specifications":{"coil":"5V"},"reusability_score":8,"market_value_low":0.5,"market_value_high":2.0,"confidence":0.92}]}"#;

    #[tokio::test]
    async fn test_direct_success_records_cost() {
        let model = ScriptedModel::new(vec![ok(RELAY)]);
        let (orch, costs) = orchestrator(model.clone());

        let result = orch.identify("u1", &image("fp1")).await.unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].component_name, "5V relay");
        assert_eq!(result.parse_path, Some(ParsePath::Direct));
        assert!(!result.cached);

        let records = costs.snapshot().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].scan_id.as_deref(), Some(result.scan_id.as_str()));
        assert!((records[0].cost - 0.002).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_fenced_response_parses_like_direct() {
        let fenced = format!("```json\n{}\n```", RELAY);
        let (direct_orch, _) = orchestrator(ScriptedModel::new(vec![ok(RELAY)]));
        let (fenced_orch, _) = orchestrator(ScriptedModel::new(vec![ok(&fenced)]));

        let direct = direct_orch.identify("u1", &image("a")).await.unwrap();
        let unwrapped = fenced_orch.identify("u1", &image("a")).await.unwrap();
        assert_eq!(direct.items, unwrapped.items);
        assert_eq!(unwrapped.parse_path, Some(ParsePath::Unwrapped));
    }

    #[tokio::test]
    async fn test_rate_limited_still_records_cost() {
        let (orch, costs) = orchestrator(ScriptedModel::new(vec![status(429, "slow down")]));
        let err = orch.identify("u1", &image("fp")).await.unwrap_err();
        assert_eq!(
            err,
            ScanError::RateLimited {
                excerpt: "slow down".to_string()
            }
        );
        assert_eq!(costs.len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_failure_carries_status() {
        let (orch, costs) = orchestrator(ScriptedModel::new(vec![status(503, "overloaded")]));
        match orch.identify("u1", &image("fp")).await.unwrap_err() {
            ScanError::UpstreamFailure { status, excerpt } => {
                assert_eq!(status, Some(503));
                assert_eq!(excerpt, "overloaded");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(costs.len(), 1);
    }

    #[tokio::test]
    async fn test_unparsable_is_parse_error() {
        let (orch, costs) = orchestrator(ScriptedModel::new(vec![ok("I think it is a relay.")]));
        assert!(matches!(
            orch.identify("u1", &image("fp")).await,
            Err(ScanError::Parse(_))
        ));
        assert_eq!(costs.len(), 1);
    }

    #[tokio::test]
    async fn test_misconfigured_short_circuits() {
        let model = ScriptedModel::unconfigured();
        let (orch, costs) = orchestrator(model.clone());
        assert!(matches!(
            orch.identify("u1", &image("fp")).await,
            Err(ScanError::Misconfigured(_))
        ));
        assert_eq!(model.calls(), 0);
        assert!(costs.is_empty());
    }

    #[tokio::test]
    async fn test_validation_before_network() {
        let model = ScriptedModel::new(vec![]);
        let (orch, costs) = orchestrator(model.clone());
        assert!(matches!(
            orch.identify("", &image("fp")).await,
            Err(ScanError::Validation(_))
        ));
        assert!(matches!(
            orch.identify("u1", &image("")).await,
            Err(ScanError::Validation(_))
        ));
        assert_eq!(model.calls(), 0);
        assert!(costs.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_emits_no_cost() {
        let (orch, costs) = orchestrator(ScriptedModel::new(vec![Err(ScanError::upstream(
            None,
            "connection refused",
        ))]));
        assert!(matches!(
            orch.identify("u1", &image("fp")).await,
            Err(ScanError::UpstreamFailure { status: None, .. })
        ));
        assert!(costs.is_empty());
    }

    #[tokio::test]
    async fn test_cache_hit_skips_upstream() {
        let model = ScriptedModel::new(vec![ok(RELAY)]);
        let (orch, costs) = orchestrator(model.clone());

        let first = orch.identify("u1", &image("same")).await.unwrap();
        let second = orch.identify("u1", &image("same")).await.unwrap();
        assert!(second.cached);
        assert_eq!(first.items, second.items);
        assert_ne!(first.scan_id, second.scan_id);
        assert_eq!(model.calls(), 1);
        assert_eq!(costs.len(), 1);
    }

    #[tokio::test]
    async fn test_lenient_shapes_and_sanitizing() {
        let body = r#"[{"component_name":"  capacitor ","confidence":3.5,"market_value_low":9,"market_value_high":1},{"component_name":""},{"oops":true}]"#;
        let (orch, _) = orchestrator(ScriptedModel::new(vec![ok(body)]));
        let result = orch.identify("u1", &image("fp")).await.unwrap();
        assert_eq!(result.items.len(), 1);
        let item = &result.items[0];
        assert_eq!(item.component_name, "capacitor");
        assert_eq!(item.confidence, 1.0);
        assert_eq!((item.market_value_low, item.market_value_high), (1.0, 9.0));
    }

    #[tokio::test]
    async fn test_single_object_and_empty_items() {
        let (orch, _) = orchestrator(ScriptedModel::new(vec![
            ok(r#"{"component_name":"stepper motor"}"#),
            ok(r#"{"items":[]}"#),
        ]));
        let one = orch.identify("u1", &image("x")).await.unwrap();
        assert_eq!(one.items[0].component_name, "stepper motor");
        let none = orch.identify("u1", &image("y")).await.unwrap();
        assert!(none.items.is_empty());
    }

    #[tokio::test]
    async fn test_all_entries_malformed_is_parse_error() {
        let (orch, _) = orchestrator(ScriptedModel::new(vec![ok(r#"{"items":[{"x":1}]}"#)]));
        assert!(matches!(
            orch.identify("u1", &image("fp")).await,
            Err(ScanError::Parse(_))
        ));
    }
}
