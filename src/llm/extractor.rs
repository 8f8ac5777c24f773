use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::models::ScoreValue;

/// Result of pulling scores and justifications out of free-form model
/// output. Extraction never fails hard: problems land in `warning`,
/// empty maps plus a warning mean nothing usable was recovered, while
/// populated maps plus a warning mean a partial or suspect extraction.
#[derive(Debug, Default)]
pub struct Extraction {
    pub scores: BTreeMap<String, ScoreValue>,
    pub justifications: BTreeMap<String, String>,
    pub warning: Option<String>,
}

impl Extraction {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            warning: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty() && self.justifications.is_empty()
    }
}

/// Ordered JSON recovery strategies; the first one that produces a JSON
/// object wins.
const JSON_STRATEGIES: &[fn(&str) -> Option<Value>] = &[fenced_block, brace_span, whole_text];

pub fn recover_json(text: &str) -> Option<Value> {
    JSON_STRATEGIES.iter().find_map(|strategy| strategy(text))
}

/// Parses scores/justifications out of raw model output. `context` is
/// only used to label log lines, typically "sensor=..., model=...".
pub fn extract(raw_text: &str, context: Option<&str>) -> Extraction {
    if raw_text.trim().is_empty() {
        return Extraction::failed("Empty response received");
    }

    // An error payload that leaked into the response body is not worth
    // parsing; surface it directly.
    if looks_like_api_error(raw_text) {
        return Extraction::failed(format!("API error: {}", truncate(raw_text, 200)));
    }

    if let Some(value) = recover_json(raw_text) {
        if value.get("error").is_some() {
            return Extraction::failed(format!("API error: {}", truncate(&value.to_string(), 200)));
        }

        let (scores, justifications) = normalize_keys(&value);
        if scores.is_empty() {
            tracing::debug!(
                "JSON recovered but no score keys found ({})",
                context.unwrap_or("no context")
            );
            // Keep any justifications that did come through; the caller
            // distinguishes this from a partial extraction by the empty
            // score map.
            return Extraction {
                scores,
                justifications,
                warning: Some("Could not extract any scores from the response".to_string()),
            };
        }
        let warning = range_warning(&scores);
        return Extraction {
            scores,
            justifications,
            warning,
        };
    }

    let fallback = regex_fallback(raw_text);
    if fallback.is_empty() {
        tracing::debug!(
            "No JSON and no score patterns in response ({})",
            context.unwrap_or("no context")
        );
        return Extraction::failed("Could not find valid JSON in response");
    }
    fallback
}

fn looks_like_api_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["rate limit", "api error", "status code"]
        .iter()
        .any(|marker| lower.contains(marker))
}

fn fenced_block(text: &str) -> Option<Value> {
    for candidate in fenced_candidates(text, "```json") {
        if let Some(value) = parse_object(candidate.trim()) {
            return Some(value);
        }
    }
    for candidate in fenced_candidates(text, "```") {
        // A generic fence may open with a language tag on its own line.
        let body = candidate.trim();
        let body = if body.starts_with('{') {
            body
        } else {
            match body.split_once('\n') {
                Some((_, rest)) => rest.trim(),
                None => body,
            }
        };
        if let Some(value) = parse_object(body) {
            return Some(value);
        }
    }
    None
}

fn fenced_candidates<'a>(text: &'a str, fence: &str) -> Vec<&'a str> {
    let mut candidates = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(fence) {
        let body = &rest[start + fence.len()..];
        match body.find("```") {
            Some(end) => {
                candidates.push(&body[..end]);
                rest = &body[end + 3..];
            }
            None => break,
        }
    }
    candidates
}

/// Scans for balanced `{...}` spans (string- and escape-aware) and tries
/// each as JSON, starting from the earliest opening brace.
fn brace_span(text: &str) -> Option<Value> {
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find('{') {
        let start = search_from + rel;
        if let Some(len) = balanced_len(&text[start..]) {
            if let Some(value) = parse_object(&text[start..start + len]) {
                return Some(value);
            }
        }
        search_from = start + 1;
    }
    None
}

fn balanced_len(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn whole_text(text: &str) -> Option<Value> {
    parse_object(text.trim())
}

fn parse_object(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(|value| value.is_object())
}

enum KeyKind {
    Score(String),
    Justification(String),
}

const JUSTIFICATION_SUFFIXES: [&str; 3] = ["justification", "reasoning", "explanation"];

/// Maps the key spellings models actually produce ("P1", "p1_score",
/// "score_p1", "overall_score", "p1_reasoning", ...) onto the canonical
/// "P1".."P16" / "Overall" keys.
fn classify_key(key: &str) -> Option<KeyKind> {
    let lower = key.to_lowercase();
    let parts: Vec<&str> = lower.split('_').collect();
    match parts.as_slice() {
        [token] => canonical_criterion(token).map(KeyKind::Score),
        [token, "score"] => canonical_criterion(token).map(KeyKind::Score),
        ["score", token] => canonical_criterion(token).map(KeyKind::Score),
        [token, suffix] if JUSTIFICATION_SUFFIXES.contains(suffix) => {
            canonical_criterion(token).map(KeyKind::Justification)
        }
        [suffix, token] if JUSTIFICATION_SUFFIXES.contains(suffix) => {
            canonical_criterion(token).map(KeyKind::Justification)
        }
        _ => None,
    }
}

fn canonical_criterion(token: &str) -> Option<String> {
    if token == "overall" {
        return Some("Overall".to_string());
    }
    let digits = token.strip_prefix('p')?;
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return Some(format!("P{}", digits));
    }
    None
}

fn normalize_keys(value: &Value) -> (BTreeMap<String, ScoreValue>, BTreeMap<String, String>) {
    let mut scores = BTreeMap::new();
    let mut justifications = BTreeMap::new();

    let Some(object) = value.as_object() else {
        return (scores, justifications);
    };

    for (key, val) in object {
        match classify_key(key) {
            Some(KeyKind::Score(criterion)) => {
                scores.insert(criterion, score_value(val));
            }
            Some(KeyKind::Justification(criterion)) => {
                justifications.insert(criterion, text_value(val));
            }
            None => {}
        }
    }

    (scores, justifications)
}

fn score_value(val: &Value) -> ScoreValue {
    if let Some(n) = val.as_i64() {
        ScoreValue::Numeric(n)
    } else if let Some(s) = val.as_str() {
        ScoreValue::Text(s.to_string())
    } else {
        ScoreValue::Text(val.to_string())
    }
}

fn text_value(val: &Value) -> String {
    val.as_str().map(str::to_string).unwrap_or_else(|| val.to_string())
}

/// Numeric scores outside 1-5 are kept but flagged; "N/A" is fine.
fn range_warning(scores: &BTreeMap<String, ScoreValue>) -> Option<String> {
    let out_of_range: Vec<String> = scores
        .iter()
        .filter(|(_, score)| !score.is_valid_likert())
        .map(|(key, score)| format!("{}={}", key, score))
        .collect();
    if out_of_range.is_empty() {
        None
    } else {
        Some(format!(
            "Warning: scores outside expected 1-5 range: {}",
            out_of_range.join(", ")
        ))
    }
}

static SCORE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bp(\d{1,2})\s*score\s*[:=]\s*(\d{1,2})").unwrap());
static OVERALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\boverall(?:\s+score)?\s*[:=]\s*(\d{1,2})").unwrap());
static JUSTIFICATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:p(\d{1,2})|overall)\s*justification\s*[:=]?\s*").unwrap());
static BOUNDARY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bp\d{1,2}\s*(?:score|justification)\b|\boverall\b").unwrap());

/// Last resort for responses with no recoverable JSON: pull
/// "P<n> Score: <int>" pairs plus the prose following justification
/// markers, cut at the next marker or paragraph break.
fn regex_fallback(text: &str) -> Extraction {
    let mut scores = BTreeMap::new();
    let mut justifications = BTreeMap::new();

    for caps in SCORE_RE.captures_iter(text) {
        if let (Some(n), Some(value)) = (caps.get(1), caps.get(2)) {
            if let Ok(value) = value.as_str().parse::<i64>() {
                scores.insert(format!("P{}", n.as_str()), ScoreValue::Numeric(value));
            }
        }
    }
    if let Some(caps) = OVERALL_RE.captures(text) {
        if let Some(value) = caps.get(1).and_then(|m| m.as_str().parse::<i64>().ok()) {
            scores.insert("Overall".to_string(), ScoreValue::Numeric(value));
        }
    }

    let boundaries: Vec<usize> = BOUNDARY_RE.find_iter(text).map(|m| m.start()).collect();
    for caps in JUSTIFICATION_RE.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let criterion = match caps.get(1) {
            Some(n) => format!("P{}", n.as_str()),
            None => "Overall".to_string(),
        };
        let start = whole.end();
        let mut end = boundaries
            .iter()
            .copied()
            .find(|&b| b > start)
            .unwrap_or(text.len());
        if let Some(para) = text[start..end].find("\n\n") {
            end = start + para;
        }
        let body = text[start..end].trim();
        if !body.is_empty() {
            justifications.insert(criterion, body.to_string());
        }
    }

    let warning = range_warning(&scores);
    Extraction {
        scores,
        justifications,
        warning,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_json_block_yields_canonical_keys() {
        let raw = r#"Here is my review:
```json
{"p1_score": 4, "p1_justification": "ok", "p2_score": 3, "p2_justification": "thin", "overall_score": 5, "overall_justification": "good"}
```
Hope that helps."#;

        let extraction = extract(raw, None);
        assert!(extraction.warning.is_none());
        assert_eq!(extraction.scores["P1"], ScoreValue::Numeric(4));
        assert_eq!(extraction.scores["P2"], ScoreValue::Numeric(3));
        assert_eq!(extraction.scores["Overall"], ScoreValue::Numeric(5));
        assert_eq!(extraction.justifications["P1"], "ok");
        assert_eq!(extraction.justifications["Overall"], "good");
    }

    #[test]
    fn generic_fence_with_language_tag_is_handled() {
        let raw = "```\njson\n{\"P1\": 2, \"p1_justification\": \"weak\"}\n```";
        let extraction = extract(raw, None);
        assert_eq!(extraction.scores["P1"], ScoreValue::Numeric(2));
    }

    #[test]
    fn rate_limit_text_short_circuits_to_api_error() {
        let raw = "The request failed: rate limit exceeded, please slow down";
        let extraction = extract(raw, None);
        assert!(extraction.is_empty());
        let warning = extraction.warning.unwrap();
        assert!(warning.starts_with("API error:"), "got: {warning}");
    }

    #[test]
    fn json_error_payload_short_circuits() {
        let raw = r#"{"error": {"message": "model overloaded"}}"#;
        let extraction = extract(raw, None);
        assert!(extraction.is_empty());
        assert!(extraction.warning.unwrap().starts_with("API error:"));
    }

    #[test]
    fn brace_span_between_prose_is_recovered() {
        let raw = r#"Sure! The scores are {"P1": 3, "P1_justification": "x", "Overall": 2} as requested."#;
        let extraction = extract(raw, None);
        assert_eq!(extraction.scores["P1"], ScoreValue::Numeric(3));
        assert_eq!(extraction.scores["Overall"], ScoreValue::Numeric(2));
        assert_eq!(extraction.justifications["P1"], "x");
    }

    #[test]
    fn nested_braces_inside_strings_do_not_break_the_scan() {
        let raw = r#"prefix {"p1_score": 5, "p1_justification": "uses {braces} and \"quotes\""} suffix"#;
        let extraction = extract(raw, None);
        assert_eq!(extraction.scores["P1"], ScoreValue::Numeric(5));
    }

    #[test]
    fn bare_json_object_is_recovered() {
        let raw = r#"  {"score_p4": 4, "p4_explanation": "solid"}  "#;
        let extraction = extract(raw, None);
        assert_eq!(extraction.scores["P4"], ScoreValue::Numeric(4));
        assert_eq!(extraction.justifications["P4"], "solid");
    }

    #[test]
    fn regex_fallback_recovers_plain_text_scores() {
        let raw = "P1 Score: 4 P1 Justification: good fit Overall: 5";
        let extraction = extract(raw, None);
        assert_eq!(extraction.scores["P1"], ScoreValue::Numeric(4));
        assert_eq!(extraction.scores["Overall"], ScoreValue::Numeric(5));
        assert_eq!(extraction.justifications["P1"], "good fit");
    }

    #[test]
    fn json_without_score_keys_is_an_extraction_failure() {
        let raw = r#"{"summary": "looks fine", "notes": []}"#;
        let extraction = extract(raw, None);
        assert!(extraction.is_empty());
        assert_eq!(
            extraction.warning.as_deref(),
            Some("Could not extract any scores from the response")
        );
    }

    #[test]
    fn empty_input_reports_empty_response() {
        let extraction = extract("   ", None);
        assert_eq!(extraction.warning.as_deref(), Some("Empty response received"));
    }

    #[test]
    fn out_of_range_scores_are_kept_but_flagged() {
        let raw = r#"{"p9_score": 7, "p9_justification": "?", "overall_score": 4}"#;
        let extraction = extract(raw, None);
        assert_eq!(extraction.scores["P9"], ScoreValue::Numeric(7));
        let warning = extraction.warning.unwrap();
        assert!(warning.contains("P9=7"), "got: {warning}");
    }

    #[test]
    fn na_sentinel_passes_without_warning() {
        let raw = r#"{"p16_score": "N/A", "p16_justification": "not covered", "overall_score": 3}"#;
        let extraction = extract(raw, None);
        assert!(extraction.warning.is_none());
        assert!(extraction.scores["P16"].is_not_applicable());
    }

    #[test]
    fn nothing_recoverable_reports_no_json() {
        let extraction = extract("the sensor looks great to me", None);
        assert!(extraction.is_empty());
        assert_eq!(
            extraction.warning.as_deref(),
            Some("Could not find valid JSON in response")
        );
    }
}
