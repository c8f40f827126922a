//! The structured reply the LLM returns for every turn, and the scan that
//! extracts its first complete spoken sentence from a still-streaming
//! response without a streaming JSON parser.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Hi,
    Add,
    Info,
    Recommend,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationField {
    pub product_id: i64,
    pub product_name: String,
    pub reason: String,
}

/// The assistant's reply for one turn, as returned by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub spoken_response: String,
    pub intent: Intent,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub product_id: Option<i64>,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub recommendation: Option<RecommendationField>,
}

fn default_quantity() -> i64 {
    1
}

impl ReplyEnvelope {
    /// Parse the LLM's accumulated output into an envelope. Strips a
    /// fenced code block if present, then parses the JSON object delimited
    /// by the first `{` and last `}`. Falls back to a default `info`
    /// envelope wrapping the raw text if parsing fails.
    pub fn parse_or_fallback(raw: &str) -> Self {
        match Self::parse(raw) {
            Ok(envelope) => envelope,
            Err(_) => Self {
                spoken_response: raw.trim().to_owned(),
                intent: Intent::Info,
                product_name: None,
                product_id: None,
                quantity: 1,
                recommendation: None,
            },
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        let stripped = strip_code_fence(raw);
        let start = stripped
            .find('{')
            .ok_or_else(|| CoreError::EnvelopeParseFailure("no opening brace".into()))?;
        let end = stripped
            .rfind('}')
            .ok_or_else(|| CoreError::EnvelopeParseFailure("no closing brace".into()))?;
        if end < start {
            return Err(CoreError::EnvelopeParseFailure("brace mismatch".into()));
        }
        let json_slice = &stripped[start..=end];
        serde_json::from_str(json_slice)
            .map_err(|e| CoreError::EnvelopeParseFailure(e.to_string()))
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.strip_suffix("```").unwrap_or(rest).trim()
    } else {
        trimmed
    }
}

/// Scan `accumulated` (the LLM's in-progress raw text) for the first
/// complete sentence inside the `spoken_response` JSON string value.
/// Returns the sentence text (unescaped minimally) if one has closed.
pub fn first_spoken_sentence(accumulated: &str) -> Option<String> {
    let key_pos = accumulated.find("\"spoken_response\"")?;
    let after_key = &accumulated[key_pos + "\"spoken_response\"".len()..];
    let colon_pos = after_key.find(':')?;
    let after_colon = &after_key[colon_pos + 1..];
    let quote_pos = after_colon.find('"')?;
    let value_start = &after_colon[quote_pos + 1..];

    let mut escaped = false;
    for (idx, ch) in value_start.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => return None, // string closed with no sentence-ending punctuation
            '.' | '!' | '?' => {
                let sentence = &value_start[..=idx];
                return Some(unescape_json_fragment(sentence));
            }
            _ => {}
        }
    }
    None
}

fn unescape_json_fragment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_envelope() {
        let raw = r#"{"spoken_response":"Of course.","intent":"add","product_name":"Kunefe","product_id":14,"quantity":2,"recommendation":null}"#;
        let env = ReplyEnvelope::parse_or_fallback(raw);
        assert_eq!(env.spoken_response, "Of course.");
        assert_eq!(env.intent, Intent::Add);
        assert_eq!(env.product_id, Some(14));
        assert_eq!(env.quantity, 2);
    }

    #[test]
    fn strips_fenced_code_block() {
        let raw = "```json\n{\"spoken_response\":\"Hi.\",\"intent\":\"hi\",\"quantity\":1}\n```";
        let env = ReplyEnvelope::parse_or_fallback(raw);
        assert_eq!(env.spoken_response, "Hi.");
        assert_eq!(env.intent, Intent::Hi);
    }

    #[test]
    fn falls_back_to_info_on_unparseable_text() {
        let raw = "Sure, I can help with that, no JSON here.";
        let env = ReplyEnvelope::parse_or_fallback(raw);
        assert_eq!(env.intent, Intent::Info);
        assert_eq!(env.spoken_response, raw);
    }

    #[test]
    fn first_sentence_detected_once_punctuation_seen() {
        let partial = r#"{"spoken_response":"Of course, I'll add that to your cart. One"#;
        let sentence = first_spoken_sentence(partial).unwrap();
        assert_eq!(sentence, "Of course, I'll add that to your cart.");
    }

    #[test]
    fn first_sentence_none_until_punctuation_arrives() {
        let partial = r#"{"spoken_response":"Of course, I'll add"#;
        assert!(first_spoken_sentence(partial).is_none());
    }

    #[test]
    fn first_sentence_none_if_value_closes_without_punctuation() {
        let partial = r#"{"spoken_response":"Hi","intent":"hi""#;
        assert!(first_spoken_sentence(partial).is_none());
    }
}
