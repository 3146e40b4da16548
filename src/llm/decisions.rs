//! Typed decision variants parsed from protocol messages
//!
//! Every LLM reply is forced into one of these shapes before any component
//! acts on it. A shape the component does not understand is a schema miss,
//! reported as an `Llm` error, never coerced.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::SpiderError;

use super::ProtocolMessage;

/// What the explorer asked the model about the current list page
#[derive(Debug, Clone)]
pub enum ExploreDecision {
    /// The current page already is a detail page
    ReportDetailPage,
    /// Candidate detail links, as claimed mark_id → visible text
    SelectDetailLinks { mark_id_text_map: BTreeMap<String, String> },
    /// Click one element to get closer to the links
    Click { mark_id: Option<u64>, target_text: String },
    /// Scroll the list to reveal more entries
    Scroll,
}

impl ExploreDecision {
    pub fn from_message(message: &ProtocolMessage) -> Result<Self, SpiderError> {
        match message.action.as_str() {
            "report" => {
                let kind = message.arg_str("page_kind").unwrap_or_default();
                if kind.eq_ignore_ascii_case("detail") {
                    Ok(Self::ReportDetailPage)
                } else {
                    Err(SpiderError::Llm(format!("unexpected page_kind '{kind}'")))
                }
            }
            "select" => {
                let map = extract_mark_id_text_map(message)?;
                Ok(Self::SelectDetailLinks { mark_id_text_map: map })
            }
            "click" => Ok(Self::Click {
                mark_id: message.arg_u64("mark_id"),
                target_text: message.arg_str("target_text").unwrap_or_default().to_string(),
            }),
            "scroll" => Ok(Self::Scroll),
            other => Err(SpiderError::Llm(format!("unknown explore action '{other}'"))),
        }
    }
}

/// What the navigator asked the model to do next on the way to the list
#[derive(Debug, Clone)]
pub enum NavDecision {
    Click { mark_id: Option<u64>, target_text: String },
    Type { mark_id: Option<u64>, target_text: String, text: String, key: Option<String> },
    Press { key: String },
    Scroll,
    Wait { timeout_ms: Option<u64> },
    Done,
}

impl NavDecision {
    pub fn from_message(message: &ProtocolMessage) -> Result<Self, SpiderError> {
        match message.action.as_str() {
            "click" => Ok(Self::Click {
                mark_id: message.arg_u64("mark_id"),
                target_text: message.arg_str("target_text").unwrap_or_default().to_string(),
            }),
            "type" => Ok(Self::Type {
                mark_id: message.arg_u64("mark_id"),
                target_text: message.arg_str("target_text").unwrap_or_default().to_string(),
                text: message
                    .arg_str("text")
                    .map(str::to_string)
                    .ok_or_else(|| SpiderError::Llm("type decision missing text".into()))?,
                key: message.arg_str("key").map(str::to_string),
            }),
            "press" => Ok(Self::Press {
                key: message.arg_str("key").unwrap_or("Enter").to_string(),
            }),
            "scroll" => Ok(Self::Scroll),
            "wait" => Ok(Self::Wait {
                timeout_ms: message.arg_u64("timeout_ms"),
            }),
            "done" => Ok(Self::Done),
            other => Err(SpiderError::Llm(format!("unknown nav action '{other}'"))),
        }
    }
}

/// Pagination vision ask: the model names the next-page control or declines
#[derive(Debug, Clone)]
pub enum PaginationDecision {
    NextControl { mark_id: Option<u64>, target_text: String },
    NotFound { reasoning: String },
}

impl PaginationDecision {
    pub fn from_message(message: &ProtocolMessage) -> Result<Self, SpiderError> {
        match message.action.as_str() {
            "click" | "select" => Ok(Self::NextControl {
                mark_id: message.arg_u64("mark_id"),
                target_text: message.arg_str("target_text").unwrap_or_default().to_string(),
            }),
            "report" | "none" | "not_found" => Ok(Self::NotFound {
                reasoning: message.arg_str("reasoning").unwrap_or_default().to_string(),
            }),
            other => Err(SpiderError::Llm(format!(
                "unknown pagination action '{other}'"
            ))),
        }
    }
}

/// One step of the per-field learning loop
#[derive(Debug, Clone)]
pub enum FieldNavDecision {
    /// The field is visible; the model read its value
    Extract {
        field_value: String,
        target_text: String,
        confidence: f64,
    },
    Click { mark_id: Option<u64>, target_text: String },
    Type { mark_id: Option<u64>, text: String },
    Scroll,
}

impl FieldNavDecision {
    pub fn from_message(message: &ProtocolMessage) -> Result<Self, SpiderError> {
        match message.action.as_str() {
            "extract" => {
                let field_value = message
                    .arg_str("field_value")
                    .or_else(|| message.arg_str("field_text"))
                    .map(str::to_string)
                    .ok_or_else(|| SpiderError::Llm("extract decision missing field_value".into()))?;
                Ok(Self::Extract {
                    target_text: message
                        .arg_str("target_text")
                        .unwrap_or(&field_value)
                        .to_string(),
                    confidence: message.arg_f64("confidence").unwrap_or(0.5),
                    field_value,
                })
            }
            "click" => Ok(Self::Click {
                mark_id: message.arg_u64("mark_id"),
                target_text: message.arg_str("target_text").unwrap_or_default().to_string(),
            }),
            "type" => Ok(Self::Type {
                mark_id: message.arg_u64("mark_id"),
                text: message
                    .arg_str("text")
                    .map(str::to_string)
                    .ok_or_else(|| SpiderError::Llm("type decision missing text".into()))?,
            }),
            "scroll" => Ok(Self::Scroll),
            other => Err(SpiderError::Llm(format!(
                "unknown field nav action '{other}'"
            ))),
        }
    }
}

/// The overlay-renumber reselection answer: a 1..=N index
pub fn parse_selected_index(message: &ProtocolMessage, candidate_count: usize) -> Option<usize> {
    let selected = message
        .arg_u64("selected_mark_id")
        .or_else(|| message.arg_u64("mark_id"))?;
    let selected = usize::try_from(selected).ok()?;
    (1..=candidate_count).contains(&selected).then_some(selected)
}

/// Semantic validation verdict for an extracted value
#[derive(Debug, Clone)]
pub struct ValueVerdict {
    pub is_valid: bool,
    pub normalized_value: String,
    pub reason: String,
}

impl ValueVerdict {
    pub fn from_message(message: &ProtocolMessage, fallback_value: &str) -> Self {
        let normalized = message
            .arg_str("normalized_value")
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(fallback_value)
            .to_string();
        Self {
            is_valid: message.arg_bool("is_valid").unwrap_or(false),
            normalized_value: normalized,
            reason: message.arg_str("reason").unwrap_or_default().to_string(),
        }
    }
}

fn extract_mark_id_text_map(
    message: &ProtocolMessage,
) -> Result<BTreeMap<String, String>, SpiderError> {
    let raw = message
        .args
        .get("mark_id_text_map")
        .ok_or_else(|| SpiderError::Llm("select decision missing mark_id_text_map".into()))?;
    let Value::Object(map) = raw else {
        return Err(SpiderError::Llm("mark_id_text_map is not an object".into()));
    };
    let mut out = BTreeMap::new();
    for (key, value) in map {
        if let Some(text) = value.as_str() {
            out.insert(key.clone(), text.to_string());
        }
    }
    if out.is_empty() {
        return Err(SpiderError::Llm("mark_id_text_map is empty".into()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::parse_protocol_message;

    #[test]
    fn test_select_decision() {
        let message = parse_protocol_message(
            r#"{"action": "select", "args": {"purpose": "detail_links",
                "mark_id_text_map": {"12": "查看详情", "17": "查看详情"}}}"#,
        )
        .expect("parse");
        let decision = ExploreDecision::from_message(&message).expect("decision");
        match decision {
            ExploreDecision::SelectDetailLinks { mark_id_text_map } => {
                assert_eq!(mark_id_text_map.len(), 2);
                assert_eq!(mark_id_text_map["12"], "查看详情");
            }
            other => panic!("expected select, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_action_is_schema_miss() {
        let message =
            parse_protocol_message(r#"{"action": "fly", "args": {}}"#).expect("parse");
        assert!(ExploreDecision::from_message(&message).is_err());
        assert!(NavDecision::from_message(&message).is_err());
    }

    #[test]
    fn test_selected_index_bounds() {
        let message = parse_protocol_message(r#"{"action": "select", "selected_mark_id": 3}"#)
            .expect("parse");
        assert_eq!(parse_selected_index(&message, 5), Some(3));
        assert_eq!(parse_selected_index(&message, 2), None);
    }

    #[test]
    fn test_value_verdict_defaults() {
        let message = parse_protocol_message(r#"{"action": "validate", "is_valid": true}"#)
            .expect("parse");
        let verdict = ValueVerdict::from_message(&message, "2026-01-01");
        assert!(verdict.is_valid);
        assert_eq!(verdict.normalized_value, "2026-01-01");
    }
}
