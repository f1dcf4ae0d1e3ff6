use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub costs: CostsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API credential.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// USD per million input tokens.
    #[serde(default = "default_input_cost")]
    pub input_cost_per_mtok: f64,
    /// USD per million output tokens.
    #[serde(default = "default_output_cost")]
    pub output_cost_per_mtok: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_output_tokens: default_max_output_tokens(),
            input_cost_per_mtok: default_input_cost(),
            output_cost_per_mtok: default_output_cost(),
        }
    }
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/responses".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_env() -> String {
    "PARTSCAN_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_output_tokens() -> u32 {
    2048
}
fn default_input_cost() -> f64 {
    0.15
}
fn default_output_cost() -> f64 {
    0.60
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizeConfig {
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    /// JPEG quality, 1-100.
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default = "default_fingerprint_len")]
    pub fingerprint_len: usize,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            max_dimension: default_max_dimension(),
            quality: default_quality(),
            fingerprint_len: default_fingerprint_len(),
        }
    }
}

fn default_max_dimension() -> u32 {
    1024
}
fn default_quality() -> u8 {
    80
}
fn default_fingerprint_len() -> usize {
    partscan_core::fingerprint::DEFAULT_FINGERPRINT_LEN
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    /// Sleep applied when the frame source has no frame ready.
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            max_detections: default_max_detections(),
            idle_backoff_ms: default_idle_backoff_ms(),
        }
    }
}

fn default_min_confidence() -> f32 {
    0.5
}
fn default_max_detections() -> usize {
    20
}
fn default_idle_backoff_ms() -> u64 {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatcherConfig {
    /// Stable-sort results by descending score instead of trusting the model's order.
    #[serde(default)]
    pub resort: bool,
    #[serde(default = "default_prompt_warn_chars")]
    pub prompt_warn_chars: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            resort: false,
            prompt_warn_chars: default_prompt_warn_chars(),
        }
    }
}

fn default_prompt_warn_chars() -> usize {
    60_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Maximum cached fingerprints. `0` disables the cache.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

fn default_cache_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CostsConfig {
    /// Append-only JSON Lines file. In-memory when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Largest accepted request body. Base64 inflates a photo by a third.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

fn default_max_body_bytes() -> usize {
    25 * 1024 * 1024
}

impl ModelConfig {
    /// Resolve the credential from the environment. `None` when unset or blank.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

fn validate(config: &Config) -> Result<()> {
    // Validate normalize
    if config.normalize.max_dimension == 0 {
        anyhow::bail!("normalize.max_dimension must be > 0");
    }
    if !(1..=100).contains(&config.normalize.quality) {
        anyhow::bail!("normalize.quality must be in [1, 100]");
    }
    if !(1..=partscan_core::fingerprint::MAX_FINGERPRINT_LEN)
        .contains(&config.normalize.fingerprint_len)
    {
        anyhow::bail!("normalize.fingerprint_len must be in [1, 64]");
    }

    // Validate detection
    if !(0.0..=1.0).contains(&config.detection.min_confidence) {
        anyhow::bail!("detection.min_confidence must be in [0.0, 1.0]");
    }

    // Validate model
    if config.model.model.trim().is_empty() {
        anyhow::bail!("model.model must not be empty");
    }
    if config.model.api_key_env.trim().is_empty() {
        anyhow::bail!("model.api_key_env must name an environment variable");
    }
    if config.model.input_cost_per_mtok < 0.0 || config.model.output_cost_per_mtok < 0.0 {
        anyhow::bail!("model pricing must be non-negative");
    }
    if config.server.max_body_bytes == 0 {
        anyhow::bail!("server.max_body_bytes must be > 0");
    }

    Ok(())
}
