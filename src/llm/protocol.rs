//! Lenient parsing of LLM output
//!
//! Models wrap JSON in code fences, use smart quotes, leave trailing commas,
//! or bury the object in prose. Parsing tries, in order: balanced-brace
//! extraction of every candidate object, a greedy brace match, and finally a
//! field-by-field salvage of the `action`/`args`/`thinking` shape.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

static CODE_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)```(?:json)?").expect("static regex"));
static TRAILING_COMMA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("static regex"));

fn normalize_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{00A0}' => ' ',
            other => other,
        })
        .collect()
}

fn strip_code_fences(text: &str) -> String {
    if !text.contains("```") {
        return text.to_string();
    }
    CODE_FENCE_RE.replace_all(text, "").trim().to_string()
}

fn cleanup_json_text(text: &str) -> String {
    TRAILING_COMMA_RE.replace_all(text, "$1").into_owned()
}

/// Extract a brace-balanced object starting at byte offset `start`
fn extract_balanced_object(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    if *bytes.get(start)? != b'{' {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
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

fn iter_json_candidates(text: &str) -> Vec<&str> {
    let mut seen = std::collections::HashSet::new();
    let mut candidates = Vec::new();
    for (idx, _) in text.match_indices('{') {
        if let Some(obj) = extract_balanced_object(text, idx) {
            if seen.insert(obj) {
                candidates.push(obj);
            }
        }
    }
    candidates
}

/// Pull a JSON object out of arbitrary LLM text, or None if hopeless
#[must_use]
pub fn parse_json_object(text: &str) -> Option<Map<String, Value>> {
    let cleaned = normalize_quotes(&strip_code_fences(text));

    for candidate in iter_json_candidates(&cleaned) {
        if let Ok(Value::Object(map)) = serde_json::from_str(&cleanup_json_text(candidate)) {
            return Some(map);
        }
    }

    // Greedy fallback: widest brace span
    if let (Some(open), Some(close)) = (cleaned.find('{'), cleaned.rfind('}')) {
        if open < close {
            if let Ok(Value::Object(map)) =
                serde_json::from_str(&cleanup_json_text(&cleaned[open..=close]))
            {
                return Some(map);
            }
        }
    }

    salvage_action_object(&cleaned)
}

static ACTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)"action"\s*:\s*"([^"]*)""#).expect("static regex"));
static THINKING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)"thinking"\s*:\s*"([^"]*)""#).expect("static regex"));
static ARGS_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""args"\s*:\s*\{"#).expect("static regex"));

fn salvage_string(text: &str, key: &str) -> Option<String> {
    let re = Regex::new(&format!(r#"(?i)"{}"\s*:\s*"([^"]*)""#, regex::escape(key))).ok()?;
    re.captures(text).map(|c| c[1].to_string())
}

fn salvage_integer(text: &str, key: &str) -> Option<i64> {
    let re = Regex::new(&format!(r#"(?i)"{}"\s*:\s*"?(\d+)"?"#, regex::escape(key))).ok()?;
    re.captures(text).and_then(|c| c[1].parse().ok())
}

fn salvage_float(text: &str, key: &str) -> Option<f64> {
    let re = Regex::new(&format!(
        r#"(?i)"{}"\s*:\s*(-?\d+(?:\.\d+)?)"#,
        regex::escape(key)
    ))
    .ok()?;
    re.captures(text).and_then(|c| c[1].parse().ok())
}

fn salvage_bool(text: &str, key: &str) -> Option<bool> {
    let re = Regex::new(&format!(
        r#"(?i)"{}"\s*:\s*(true|false|"true"|"false"|1|0)"#,
        regex::escape(key)
    ))
    .ok()?;
    re.captures(text).map(|c| {
        let raw = c[1].trim_matches('"').to_ascii_lowercase();
        matches!(raw.as_str(), "true" | "1")
    })
}

/// Rescue the `action`/`args`/`thinking` shape from malformed text
fn salvage_action_object(text: &str) -> Option<Map<String, Value>> {
    let action = ACTION_RE.captures(text).map(|c| c[1].to_string())?;

    let mut args = Map::new();
    if let Some(m) = ARGS_OPEN_RE.find(text) {
        if let Some(obj) = extract_balanced_object(text, m.end() - 1) {
            if let Ok(Value::Object(map)) = serde_json::from_str(&cleanup_json_text(obj)) {
                args = map;
            }
        }
    }

    if args.is_empty() {
        for key in [
            "kind",
            "purpose",
            "page_kind",
            "target_text",
            "text",
            "key",
            "url",
            "reasoning",
            "field_name",
            "field_text",
            "field_value",
            "location_description",
            "xpath_pattern",
        ] {
            if let Some(v) = salvage_string(text, key) {
                args.insert(key.to_string(), Value::String(v));
            }
        }
        for key in ["mark_id", "selected_mark_id"] {
            if let Some(v) = salvage_integer(text, key) {
                args.insert(key.to_string(), Value::from(v));
            }
        }
        if let Some(v) = salvage_bool(text, "found") {
            args.insert("found".to_string(), Value::Bool(v));
        }
        if let Some(v) = salvage_float(text, "confidence") {
            args.insert("confidence".to_string(), Value::from(v));
        }
    }

    let mut out = Map::new();
    out.insert("action".to_string(), Value::String(action));
    out.insert("args".to_string(), Value::Object(args));
    if let Some(thinking) = THINKING_RE.captures(text).map(|c| c[1].to_string()) {
        out.insert("thinking".to_string(), Value::String(thinking));
    }
    Some(out)
}

/// A parsed `action` + `args` + optional `thinking` message
#[derive(Debug, Clone)]
pub struct ProtocolMessage {
    pub action: String,
    pub args: Map<String, Value>,
    pub thinking: Option<String>,
}

impl ProtocolMessage {
    #[must_use]
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn arg_u64(&self, key: &str) -> Option<u64> {
        match self.args.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn arg_f64(&self, key: &str) -> Option<f64> {
        match self.args.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn arg_bool(&self, key: &str) -> Option<bool> {
        match self.args.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(n.as_f64().unwrap_or(0.0) != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Some(true),
                "false" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Parse a unified `action` + `args` + `thinking` message from LLM text
#[must_use]
pub fn parse_protocol_message(text: &str) -> Option<ProtocolMessage> {
    let map = parse_json_object(text)?;
    let action = map
        .get("action")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())?;

    let args = match map.get("args") {
        Some(Value::Object(args)) => args.clone(),
        _ => {
            // Flat messages carry their args at the top level
            let mut flat = map.clone();
            flat.remove("action");
            flat.remove("thinking");
            flat
        }
    };

    let thinking = map
        .get("thinking")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from);

    Some(ProtocolMessage {
        action,
        args,
        thinking,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_json() {
        let msg = parse_protocol_message(r#"{"action": "click", "args": {"mark_id": 7}}"#)
            .expect("parse");
        assert_eq!(msg.action, "click");
        assert_eq!(msg.arg_u64("mark_id"), Some(7));
    }

    #[test]
    fn test_code_fenced() {
        let text = "Here you go:\n```json\n{\"action\": \"scroll\", \"args\": {}}\n```";
        let msg = parse_protocol_message(text).expect("parse");
        assert_eq!(msg.action, "scroll");
    }

    #[test]
    fn test_trailing_comma() {
        let msg = parse_protocol_message(r#"{"action": "done", "args": {"reasoning": "ok",},}"#)
            .expect("parse");
        assert_eq!(msg.action, "done");
    }

    #[test]
    fn test_smart_quotes() {
        let text = "{\u{201C}action\u{201D}: \u{201C}wait\u{201D}, \u{201C}args\u{201D}: {}}";
        let msg = parse_protocol_message(text).expect("parse");
        assert_eq!(msg.action, "wait");
    }

    #[test]
    fn test_salvage_broken_json() {
        // Unbalanced brace forces the salvage path
        let text = r#"{"action": "extract", "args": {"field_name": "title", "confidence": 0.9"#;
        let msg = parse_protocol_message(text).expect("salvage");
        assert_eq!(msg.action, "extract");
        assert_eq!(msg.arg_str("field_name"), Some("title"));
        assert_eq!(msg.arg_f64("confidence"), Some(0.9));
    }

    #[test]
    fn test_flat_args() {
        let msg = parse_protocol_message(r#"{"action": "report", "page_kind": "detail"}"#)
            .expect("parse");
        assert_eq!(msg.arg_str("page_kind"), Some("detail"));
    }

    #[test]
    fn test_empty_object_is_no_action() {
        assert!(parse_protocol_message("{}").is_none());
        assert!(parse_protocol_message("no json at all").is_none());
    }

    #[test]
    fn test_arg_coercions() {
        let msg = parse_protocol_message(
            r#"{"action": "click", "args": {"mark_id": "12", "found": "yes"}}"#,
        )
        .expect("parse");
        assert_eq!(msg.arg_u64("mark_id"), Some(12));
        assert_eq!(msg.arg_bool("found"), Some(true));
    }
}
