//! Two-stage parsing of structured model output.
//!
//! Remote models are asked for bare JSON but frequently wrap it in prose or
//! a markdown code fence. [`parse_structured`] first tries the whole text
//! as JSON and, failing that, the contents of the first fenced block whose
//! tag is empty or `json`. The outcome records which stage succeeded so both
//! paths can be exercised and reported independently.
//!
//! ```rust
//! use partscan_core::parse::{parse_structured, Parsed};
//!
//! let wrapped = "Here you go:\n```json\n{\"items\": []}\n```";
//! assert!(matches!(parse_structured(wrapped), Parsed::Unwrapped(_)));
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

const FENCE: &str = "```";

/// Result of [`parse_structured`].
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// The whole text was valid JSON.
    Direct(Value),
    /// JSON recovered from inside a fenced block.
    Unwrapped(Value),
    /// Neither stage produced JSON.
    Failed { reason: String },
}

/// Which parse stage produced a value. Reported alongside results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsePath {
    Direct,
    Unwrapped,
}

impl Parsed {
    /// Split into the JSON value and the stage that produced it.
    pub fn into_value(self) -> Result<(Value, ParsePath), String> {
        match self {
            Parsed::Direct(v) => Ok((v, ParsePath::Direct)),
            Parsed::Unwrapped(v) => Ok((v, ParsePath::Unwrapped)),
            Parsed::Failed { reason } => Err(reason),
        }
    }
}

/// Parse `text` as JSON, falling back to the first `json` fenced block.
pub fn parse_structured(text: &str) -> Parsed {
    let direct_err = match serde_json::from_str::<Value>(text.trim()) {
        Ok(value) => return Parsed::Direct(value),
        Err(e) => e,
    };

    match extract_fenced_block(text) {
        Some(inner) => match serde_json::from_str::<Value>(inner) {
            Ok(value) => Parsed::Unwrapped(value),
            Err(e) => Parsed::Failed {
                reason: format!("fenced block is not valid JSON: {}", e),
            },
        },
        None => Parsed::Failed {
            reason: format!("response is not JSON and has no fenced block: {}", direct_err),
        },
    }
}

/// Parse and deserialize into `T` in one step.
pub fn parse_as<T: DeserializeOwned>(text: &str) -> Result<(T, ParsePath), String> {
    let (value, path) = parse_structured(text).into_value()?;
    let typed = serde_json::from_value(value)
        .map_err(|e| format!("unexpected response shape: {}", e))?;
    Ok((typed, path))
}

/// Return the trimmed contents of the first fenced block tagged `json` or
/// untagged. Blocks tagged with another language are skipped.
pub fn extract_fenced_block(text: &str) -> Option<&str> {
    let mut rest = text;
    while let Some(open) = rest.find(FENCE) {
        let after = &rest[open + FENCE.len()..];
        let close = after.find(FENCE)?;
        let block = &after[..close];

        let tag_len = block
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(block.len());
        let (tag, body) = block.split_at(tag_len);
        if tag.is_empty() || tag.eq_ignore_ascii_case("json") {
            return Some(body.trim());
        }

        rest = &after[close + FENCE.len()..];
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_json() {
        let parsed = parse_structured(r#"{"items":[{"component_name":"relay"}]}"#);
        assert_eq!(
            parsed,
            Parsed::Direct(json!({"items":[{"component_name":"relay"}]}))
        );
    }

    #[test]
    fn test_fenced_json_matches_unwrapped_body() {
        let body = r#"{"items":[{"component_name":"relay","confidence":0.9}]}"#;
        let fenced = format!("```json\n{}\n```", body);

        let (direct, _) = parse_structured(body).into_value().unwrap();
        let (unwrapped, path) = parse_structured(&fenced).into_value().unwrap();
        assert_eq!(direct, unwrapped);
        assert_eq!(path, ParsePath::Unwrapped);
    }

    #[test]
    fn test_fence_inside_prose() {
        let text = "Sure! Here is the result:\n\n```\n[1, 2, 3]\n```\n\nLet me know.";
        assert_eq!(parse_structured(text), Parsed::Unwrapped(json!([1, 2, 3])));
    }

    #[test]
    fn test_uppercase_tag_and_no_newline() {
        assert_eq!(extract_fenced_block("```JSON{\"a\":1}```"), Some("{\"a\":1}"));
    }

    #[test]
    fn test_skips_other_language_blocks() {
        let text = "```python\nprint(1)\n```\nthen\n```json\n{\"ok\":true}\n```";
        assert_eq!(extract_fenced_block(text), Some("{\"ok\":true}"));
    }

    #[test]
    fn test_unterminated_fence() {
        assert_eq!(extract_fenced_block("```json\n{\"a\":1}"), None);
    }

    #[test]
    fn test_garbage_fails() {
        match parse_structured("not valid json at all") {
            Parsed::Failed { reason } => assert!(reason.contains("no fenced block")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_fenced_garbage_fails() {
        assert!(matches!(
            parse_structured("```json\n{broken\n```"),
            Parsed::Failed { .. }
        ));
    }

    #[test]
    fn test_parse_as_shape_error() {
        #[derive(serde::Deserialize, Debug)]
        struct Shape {
            #[allow(dead_code)]
            items: Vec<u32>,
        }
        let err = parse_as::<Shape>(r#"{"things":[]}"#).unwrap_err();
        assert!(err.contains("unexpected response shape"));
    }
}
