//! Tolerant extraction of the structured payload from free-form model output.
//!
//! Extraction runs in two stages: a fenced code block first, then the first
//! balanced top-level `{...}` span. Short plain-prose replies that make no
//! attempt at structure become a low-confidence placeholder instead of an
//! error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::StructuredResult;

/// Replies shorter than this with no JSON markers are treated as prose.
pub const MIN_STRUCTURED_CHARS: usize = 160;
pub const MAX_PRIMARY_FACTORS: usize = 5;
/// Confidence assigned to synthesized placeholder results.
pub const LOW_CONFIDENCE: f64 = 0.1;

static REFUSAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(i\s+(?:cannot|can't|can not|am unable to|'m unable to|won't be able to)|unable to (?:analy[sz]e|process|determine|provide)|not enough (?:information|content|context)|insufficient (?:information|content|input|context))",
    )
    .expect("static refusal pattern")
});

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty response")]
    Empty,
    #[error("no structured content found in response")]
    NoStructuredContent,
    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("model declined to analyze: {0}")]
    Refusal(String),
    #[error("invalid payload: {0}")]
    Invalid(&'static str),
}

impl ParseError {
    /// Whether another attempt could plausibly produce a usable reply.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ParseError::Empty | ParseError::NoStructuredContent | ParseError::Malformed(_)
        )
    }
}

/// Parse a raw model reply into a validated `StructuredResult`.
pub fn parse(raw: &str) -> Result<StructuredResult, ParseError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ParseError::Empty);
    }

    let value = match extract_json(text) {
        Some(candidate) => match serde_json::from_str::<Value>(candidate) {
            Ok(value) => value,
            // A stray brace in a refusal must not turn it into a retry.
            Err(_) if REFUSAL.is_match(text) => return Err(ParseError::Refusal(snippet(text))),
            Err(err) => return Err(err.into()),
        },
        None => {
            if REFUSAL.is_match(text) {
                return Err(ParseError::Refusal(snippet(text)));
            }
            if text.chars().count() < MIN_STRUCTURED_CHARS && !looks_structured(text) {
                return Ok(placeholder(text));
            }
            return Err(ParseError::NoStructuredContent);
        }
    };

    let Value::Object(object) = value else {
        return Err(ParseError::Invalid("top-level JSON value is not an object"));
    };
    let result: StructuredResult = serde_json::from_value(Value::Object(object))
        .map_err(|_| ParseError::Invalid("payload is missing required fields"))?;
    validate(result)
}

/// Locate the JSON object inside a reply, fenced block first.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(inner) = fenced_block(text) {
        if let Some(span) = balanced_object(inner) {
            return Some(span);
        }
    }
    balanced_object(text)
}

/// Contents of the first ``` fenced block, without the language tag.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_ticks = &text[open + 3..];
    let body_start = after_ticks.find('\n').map(|i| i + 1)?;
    let body = &after_ticks[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

/// First balanced `{...}` span, ignoring braces inside JSON strings.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn looks_structured(text: &str) -> bool {
    text.contains('{') || text.contains("```")
}

fn validate(mut result: StructuredResult) -> Result<StructuredResult, ParseError> {
    result.classification = result.classification.trim().to_string();
    if result.classification.is_empty() {
        return Err(ParseError::Invalid("classification is empty"));
    }
    result.primary_factors = result
        .primary_factors
        .into_iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .take(MAX_PRIMARY_FACTORS)
        .collect();
    if result.primary_factors.is_empty() {
        return Err(ParseError::Invalid("primary_factors is empty"));
    }
    if !result.confidence.is_finite() {
        return Err(ParseError::Invalid("confidence is not a number"));
    }
    result.confidence = result.confidence.clamp(0.0, 1.0);
    Ok(result)
}

fn placeholder(text: &str) -> StructuredResult {
    let mut extra = Map::new();
    extra.insert("unstructured_reply".to_string(), Value::String(text.to_string()));
    StructuredResult {
        classification: "unclassified".to_string(),
        primary_factors: vec!["insufficient_signal".to_string()],
        opening_strategy: String::new(),
        confidence: LOW_CONFIDENCE,
        extra,
    }
}

fn snippet(text: &str) -> String {
    text.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BARE: &str = r#"{"classification":"x","primary_factors":["a"],"opening_strategy":"s","confidence":0.5}"#;

    #[test]
    fn fenced_with_prose_matches_bare() {
        let wrapped = format!("Sure, here is the analysis:\n```json\n{}\n```", BARE);
        let fenced = parse(&wrapped).unwrap();
        let bare = parse(BARE).unwrap();
        assert_eq!(fenced, bare);
        assert_eq!(bare.classification, "x");
        assert_eq!(bare.primary_factors, vec!["a".to_string()]);
        assert_eq!(bare.opening_strategy, "s");
        assert_eq!(bare.confidence, 0.5);
    }

    #[test]
    fn brace_scan_skips_surrounding_prose_and_string_braces() {
        let raw = r#"Analysis follows {"classification":"tutorial","primary_factors":["curiosity","a } brace"],"confidence":0.9} hope that helps"#;
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.classification, "tutorial");
        assert_eq!(parsed.primary_factors[1], "a } brace");
    }

    #[test]
    fn extra_fields_are_kept() {
        let raw = r#"{"classification":"x","primary_factors":["a"],"emotional_arc":{"start":"calm"}}"#;
        let parsed = parse(raw).unwrap();
        assert!(parsed.extra.contains_key("emotional_arc"));
    }

    #[test]
    fn factors_are_capped_and_confidence_clamped() {
        let raw = r#"{"classification":"x","primary_factors":["a","b","c","d","e","f"," "],"confidence":3}"#;
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.primary_factors.len(), MAX_PRIMARY_FACTORS);
        assert_eq!(parsed.confidence, 1.0);
    }

    #[test]
    fn missing_required_fields_are_permanent() {
        let err = parse(r#"{"classification":"","primary_factors":["a"]}"#).unwrap_err();
        assert!(matches!(err, ParseError::Invalid(_)));
        assert!(!err.is_retryable());

        let err = parse(r#"{"classification":"x","primary_factors":[]}"#).unwrap_err();
        assert!(matches!(err, ParseError::Invalid(_)));

        let err = parse(r#"{"primary_factors":["a"]}"#).unwrap_err();
        assert!(matches!(err, ParseError::Invalid(_)));
    }

    #[test]
    fn truncated_json_is_retryable() {
        let err = parse(r#"Here you go: {"classification":"x","primary_factors":["a""#).unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }

    #[test]
    fn refusal_is_permanent() {
        let err = parse("I cannot analyze this video because the transcript is missing.").unwrap_err();
        assert!(matches!(err, ParseError::Refusal(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn refusal_with_braces_is_still_permanent() {
        let err = parse("I cannot analyze {this} clip, the audio is unintelligible.").unwrap_err();
        assert!(matches!(err, ParseError::Refusal(_)), "{err:?}");
        assert!(!err.is_retryable());
    }

    #[test]
    fn short_prose_becomes_low_confidence_placeholder() {
        let parsed = parse("Looks like a cooking clip.").unwrap();
        assert_eq!(parsed.confidence, LOW_CONFIDENCE);
        assert_eq!(parsed.classification, "unclassified");
        assert!(!parsed.primary_factors.is_empty());
    }

    #[test]
    fn long_prose_without_json_is_retryable() {
        let prose = "This video opens with a strong visual hook and then ".repeat(10);
        let err = parse(&prose).unwrap_err();
        assert!(matches!(err, ParseError::NoStructuredContent));
        assert!(err.is_retryable());
    }

    #[test]
    fn empty_reply_is_retryable() {
        assert!(matches!(parse("   ").unwrap_err(), ParseError::Empty));
    }
}
