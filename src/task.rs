//! User-facing task model
//!
//! A `Task` binds a list URL, a natural-language description, and the ordered
//! field definitions the extractor must fill on every detail page. Tasks are
//! immutable after clarification; the pipeline only reads them.

use serde::{Deserialize, Serialize};

use crate::error::SpiderError;

/// Expected shape of an extracted field value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Text,
    Number,
    Date,
    Url,
}

impl Default for DataType {
    fn default() -> Self {
        Self::Text
    }
}

/// One field the extractor must produce per detail page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    /// Natural-language description used for LLM navigation and validation
    pub description: String,
    /// Required fields gate page-level success and trigger the fallback
    /// learning loop when the template misses
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub data_type: DataType,
    /// Optional example value shown to the LLM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

impl FieldDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
            data_type: DataType::Text,
            example: None,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn with_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }
}

/// The user-facing unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub list_url: String,
    pub task_description: String,
    pub fields: Vec<FieldDefinition>,
}

impl Task {
    /// Validate the task before the pipeline accepts it
    pub fn validate(&self) -> Result<(), SpiderError> {
        let parsed = url::Url::parse(&self.list_url)
            .map_err(|e| SpiderError::Validation(format!("bad list_url: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SpiderError::Validation(format!(
                "list_url must be http(s), got scheme '{}'",
                parsed.scheme()
            )));
        }
        if self.task_description.trim().is_empty() {
            return Err(SpiderError::Validation(
                "task_description must not be empty".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(SpiderError::Validation("field with empty name".into()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(SpiderError::Validation(format!(
                    "duplicate field name '{}'",
                    field.name
                )));
            }
        }
        Ok(())
    }

    /// Names of the required fields, in definition order
    #[must_use]
    pub fn required_field_names(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(url: &str) -> Task {
        Task {
            list_url: url.to_string(),
            task_description: "collect tender announcements".to_string(),
            fields: vec![FieldDefinition::new("title", "announcement title").required()],
        }
    }

    #[test]
    fn test_valid_task() {
        assert!(task("https://example.com/list?page=1").validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_scheme() {
        assert!(task("ftp://example.com/list").validate().is_err());
        assert!(task("not a url").validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_fields() {
        let mut t = task("https://example.com/list");
        t.fields.push(FieldDefinition::new("title", "again"));
        assert!(t.validate().is_err());
    }
}
