//! Structured-output model transport.
//!
//! Defines the [`StructuredModel`] trait used by the identification
//! orchestrator and the project matcher, and [`HttpModel`], which calls a
//! Responses-style HTTP endpoint with `reqwest`.
//!
//! # Contract
//!
//! - `Err` from [`StructuredModel::call`] means the request never reached
//!   upstream (missing credential or transport failure). No cost is owed.
//! - `Ok(ModelReply)` means upstream answered, with any status. The caller
//!   classifies the status and is responsible for emitting a cost record.
//!   If the body fails to arrive after the status line, the reply carries
//!   that status with an empty body and no usage; it is still billable.
//! - Nothing here retries. A 429 is returned exactly once.
//!
//! # Envelope
//!
//! A successful body is unwrapped to the model's text: `output_text` when
//! present, otherwise the concatenated `output[].content[].text` parts,
//! otherwise the raw body. Token usage is read from `usage` on any status.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::ModelConfig;
use crate::error::{Result, ScanError};

/// One structured-output request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    /// Fixed instruction prompt describing the required output shape.
    pub instructions: String,
    /// Per-call user content (may be empty for image-only calls).
    pub prompt: String,
    /// Optional `data:` URL of the attached still.
    pub image_data_url: Option<String>,
}

/// Token usage reported by upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// An upstream answer of any status.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub status: u16,
    /// Unwrapped model text on success, raw body otherwise.
    pub body: String,
    pub usage: Option<Usage>,
}

impl ModelReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A remote model that answers with structured text.
#[async_trait]
pub trait StructuredModel: Send + Sync {
    /// Model identifier sent upstream (e.g. `"gpt-4o-mini"`).
    fn model_name(&self) -> &str;

    /// Whether the required credential is available. Checked before any
    /// request is built.
    fn is_configured(&self) -> bool;

    /// Send one request. See the module docs for the `Ok`/`Err` contract.
    async fn call(&self, request: &ModelRequest) -> Result<ModelReply>;
}

/// [`StructuredModel`] over HTTP.
pub struct HttpModel {
    client: reqwest::Client,
    config: ModelConfig,
}

impl HttpModel {
    pub fn new(config: &ModelConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn request_body(&self, request: &ModelRequest) -> Value {
        let mut content = Vec::new();
        if !request.prompt.is_empty() {
            content.push(json!({ "type": "input_text", "text": request.prompt }));
        }
        if let Some(url) = &request.image_data_url {
            content.push(json!({ "type": "input_image", "image_url": url }));
        }

        json!({
            "model": self.config.model,
            "instructions": request.instructions,
            "max_output_tokens": self.config.max_output_tokens,
            "input": [{ "role": "user", "content": content }],
        })
    }
}

#[async_trait]
impl StructuredModel for HttpModel {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn is_configured(&self) -> bool {
        self.config.api_key().is_some()
    }

    async fn call(&self, request: &ModelRequest) -> Result<ModelReply> {
        let api_key = self.config.api_key().ok_or_else(|| {
            ScanError::Misconfigured(format!("{} is not set", self.config.api_key_env))
        })?;

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| ScanError::upstream(None, &e.to_string()))?;

        let status = response.status().as_u16();
        let raw = match response.text().await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(status, error = %e, "Upstream body could not be read");
                String::new()
            }
        };

        Ok(reply_from(status, &raw))
    }
}

fn reply_from(status: u16, raw: &str) -> ModelReply {
    let (body, usage) = if (200..300).contains(&status) {
        unwrap_envelope(raw)
    } else {
        (raw.to_string(), read_usage(raw))
    };
    ModelReply {
        status,
        body,
        usage,
    }
}

#[derive(Deserialize)]
struct RawUsage {
    #[serde(default, alias = "prompt_tokens")]
    input_tokens: u64,
    #[serde(default, alias = "completion_tokens")]
    output_tokens: u64,
}

fn usage_from(value: &Value) -> Option<Usage> {
    let raw: RawUsage = serde_json::from_value(value.get("usage")?.clone()).ok()?;
    Some(Usage {
        input_tokens: raw.input_tokens,
        output_tokens: raw.output_tokens,
    })
}

fn read_usage(raw: &str) -> Option<Usage> {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| usage_from(&v))
}

/// Extract the model text and usage from a transport envelope.
///
/// Bodies that are not a recognizable envelope are passed through unchanged
/// so the structured-output parser still gets a chance at them.
pub fn unwrap_envelope(raw: &str) -> (String, Option<Usage>) {
    let envelope: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return (raw.to_string(), None),
    };
    let usage = usage_from(&envelope);

    if let Some(text) = envelope.get("output_text").and_then(Value::as_str) {
        return (text.to_string(), usage);
    }

    if let Some(output) = envelope.get("output").and_then(Value::as_array) {
        let text: String = output
            .iter()
            .filter_map(|o| o.get("content").and_then(Value::as_array))
            .flatten()
            .filter_map(|c| c.get("text").and_then(Value::as_str))
            .collect();
        if !text.is_empty() {
            return (text, usage);
        }
    }

    (raw.to_string(), usage)
}
