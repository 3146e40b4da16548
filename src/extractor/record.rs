//! Extraction records and field templates

use serde::{Deserialize, Serialize};

use crate::som::snapshot::XPathCandidate;
use crate::task::FieldDefinition;

/// A per-field xpath template induced from the exploration sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFieldXPath {
    pub field_name: String,
    pub xpath_pattern: String,
    /// The per-visit xpaths the pattern was induced from
    #[serde(default)]
    pub source_xpaths: Vec<String>,
    pub confidence: f64,
    /// Set once the validation sample passed
    #[serde(default)]
    pub validated: bool,
}

/// One field's result on one page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldOutcome {
    pub field_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The xpath that produced the value (template or learned fallback)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xpath: Option<String>,
    /// Candidates recorded when the fallback learner ran, so the rule
    /// library can be amended
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub xpath_candidates: Vec<XPathCandidate>,
}

impl FieldOutcome {
    #[must_use]
    pub fn missing(field_name: &str, error: impl Into<String>) -> Self {
        Self {
            field_name: field_name.to_string(),
            value: None,
            confidence: 0.0,
            error: Some(error.into()),
            xpath: None,
            xpath_candidates: Vec::new(),
        }
    }
}

/// Everything extracted from one detail page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageExtractionRecord {
    pub url: String,
    pub fields: Vec<FieldOutcome>,
    /// True iff every required field produced a value
    pub success: bool,
    pub extracted_at: String,
}

impl PageExtractionRecord {
    #[must_use]
    pub fn new(url: &str, fields: Vec<FieldOutcome>, definitions: &[FieldDefinition]) -> Self {
        let success = definitions
            .iter()
            .filter(|def| def.required)
            .all(|def| {
                fields
                    .iter()
                    .any(|outcome| outcome.field_name == def.name && outcome.value.is_some())
            });
        Self {
            url: url.to_string(),
            fields,
            success,
            extracted_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldOutcome> {
        self.fields.iter().find(|f| f.field_name == name)
    }

    /// Collected per-field errors, for queue failure reporting
    #[must_use]
    pub fn error_reason(&self) -> String {
        let errors: Vec<&str> = self
            .fields
            .iter()
            .filter_map(|f| f.error.as_deref())
            .collect();
        if errors.is_empty() {
            "extraction_failed".to_string()
        } else {
            errors.join("; ")
        }
    }

    /// Flat url → field values object, the shape written to the jsonl output
    #[must_use]
    pub fn to_item(&self) -> serde_json::Value {
        let mut item = serde_json::Map::new();
        item.insert("url".to_string(), serde_json::Value::String(self.url.clone()));
        for outcome in &self.fields {
            item.insert(
                outcome.field_name.clone(),
                outcome
                    .value
                    .clone()
                    .map_or(serde_json::Value::Null, serde_json::Value::String),
            );
        }
        serde_json::Value::Object(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FieldDefinition;

    fn definitions() -> Vec<FieldDefinition> {
        vec![
            FieldDefinition::new("title", "the title").required(),
            FieldDefinition::new("price", "the price"),
        ]
    }

    fn outcome(name: &str, value: Option<&str>) -> FieldOutcome {
        FieldOutcome {
            field_name: name.to_string(),
            value: value.map(str::to_string),
            confidence: 0.9,
            error: value.is_none().then(|| "not found".to_string()),
            xpath: None,
            xpath_candidates: Vec::new(),
        }
    }

    #[test]
    fn test_success_requires_all_required_fields() {
        let record = PageExtractionRecord::new(
            "https://example.com/1",
            vec![outcome("title", Some("Notice")), outcome("price", None)],
            &definitions(),
        );
        assert!(record.success, "optional misses must not fail the page");

        let record = PageExtractionRecord::new(
            "https://example.com/2",
            vec![outcome("title", None), outcome("price", Some("12"))],
            &definitions(),
        );
        assert!(!record.success);
        assert!(record.error_reason().contains("not found"));
    }

    #[test]
    fn test_item_shape() {
        let record = PageExtractionRecord::new(
            "https://example.com/1",
            vec![outcome("title", Some("Notice"))],
            &definitions(),
        );
        let item = record.to_item();
        assert_eq!(item["url"], "https://example.com/1");
        assert_eq!(item["title"], "Notice");
    }
}
