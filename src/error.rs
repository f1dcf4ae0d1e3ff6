//! Error taxonomy for the scan pipeline.
//!
//! `Validation`, `Misconfigured` and `Decode` are raised locally before any
//! network call. `RateLimited` and `UpstreamFailure` are surfaced once per
//! call and never retried here. `Parse` is fatal for single identification;
//! the project matcher downgrades it to an empty result instead.

/// Maximum characters of an upstream body kept in an error.
pub const EXCERPT_CHARS: usize = 300;

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScanError {
    /// Bad or missing caller input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Required configuration (the API credential) is absent.
    #[error("Service misconfigured: {0}")]
    Misconfigured(String),

    /// Upstream signalled throttling (HTTP 429).
    #[error("Rate limited by upstream: {excerpt}")]
    RateLimited { excerpt: String },

    /// Any other non-success upstream outcome. `status` is `None` when the
    /// request failed before an HTTP status existed.
    #[error("Upstream failure ({}): {excerpt}", status_label(.status))]
    UpstreamFailure { status: Option<u16>, excerpt: String },

    /// Upstream succeeded but the body could not be understood.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Input bytes are not a decodable image.
    #[error("Decode error: {0}")]
    Decode(String),
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("HTTP {}", code),
        None => "transport".to_string(),
    }
}

impl ScanError {
    pub fn rate_limited(body: &str) -> Self {
        ScanError::RateLimited {
            excerpt: excerpt(body),
        }
    }

    pub fn upstream(status: Option<u16>, body: &str) -> Self {
        ScanError::UpstreamFailure {
            status,
            excerpt: excerpt(body),
        }
    }

    /// True for errors detected before any network call.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ScanError::Validation(_) | ScanError::Misconfigured(_) | ScanError::Decode(_)
        )
    }

    /// Machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ScanError::Validation(_) => "validation_error",
            ScanError::Misconfigured(_) => "misconfigured",
            ScanError::RateLimited { .. } => "rate_limited",
            ScanError::UpstreamFailure { .. } => "upstream_failure",
            ScanError::Parse(_) => "parse_error",
            ScanError::Decode(_) => "decode_error",
        }
    }

    /// HTTP status returned to callers of the service endpoints.
    pub fn http_status(&self) -> u16 {
        match self {
            ScanError::Validation(_) | ScanError::Decode(_) => 400,
            ScanError::Misconfigured(_) => 500,
            ScanError::RateLimited { .. } => 429,
            ScanError::UpstreamFailure { .. } => 500,
            ScanError::Parse(_) => 502,
        }
    }
}

/// Truncate `body` to [`EXCERPT_CHARS`] characters on a char boundary.
pub fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
