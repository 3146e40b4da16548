//! Template-based field extraction on detail pages
//!
//! The fast path: navigate, apply each field's learned xpath, read the
//! value. A miss on a required field drops into the learning loop for that
//! field on that page, and what the learner finds is recorded so the rule
//! library can be amended.

use std::time::Duration;

use log::{debug, info, warn};

use crate::actions::ActionExecutor;
use crate::browser::{xpath, BrowserHandle, PageHandle, SharedPage};
use crate::config::SpiderConfig;
use crate::llm::LlmClient;
use crate::task::{DataType, FieldDefinition, Task};

use super::learner::learn_field_on_page;
use super::record::{CommonFieldXPath, FieldOutcome, PageExtractionRecord};

/// Extracts fields from detail pages, one URL at a time. Stateless across
/// URLs; any number of these can run in parallel off the same queue, each
/// with its own page.
pub struct FieldExtractor<'a> {
    browser: &'a dyn BrowserHandle,
    llm: Option<&'a dyn LlmClient>,
    config: &'a SpiderConfig,
    patterns: &'a [CommonFieldXPath],
    fields: &'a [FieldDefinition],
}

impl<'a> FieldExtractor<'a> {
    pub fn new(
        browser: &'a dyn BrowserHandle,
        llm: Option<&'a dyn LlmClient>,
        config: &'a SpiderConfig,
        patterns: &'a [CommonFieldXPath],
        fields: &'a [FieldDefinition],
    ) -> Self {
        Self {
            browser,
            llm,
            config,
            patterns,
            fields,
        }
    }

    /// Extract every field from one URL
    pub async fn extract_from_url(&self, page: SharedPage, url: &str) -> PageExtractionRecord {
        let timeout = Duration::from_secs(self.config.browser.page_load_timeout_secs);
        if let Err(e) = page.goto(url, timeout).await {
            warn!("navigation failed for {url}: {e}");
            let fields = self
                .fields
                .iter()
                .map(|field| FieldOutcome::missing(&field.name, format!("navigation failed: {e}")))
                .collect();
            return PageExtractionRecord::new(url, fields, self.fields);
        }

        let mut outcomes = Vec::with_capacity(self.fields.len());
        for field in self.fields {
            let outcome = self.extract_field(&page, url, field).await;
            outcomes.push(outcome);
        }

        let record = PageExtractionRecord::new(url, outcomes, self.fields);
        if record.success {
            debug!("extracted all required fields from {url}");
        } else {
            info!("extraction incomplete for {url}: {}", record.error_reason());
        }
        record
    }

    async fn extract_field(
        &self,
        page: &SharedPage,
        url: &str,
        field: &FieldDefinition,
    ) -> FieldOutcome {
        let pattern = self
            .patterns
            .iter()
            .find(|p| p.field_name == field.name);

        if let Some(pattern) = pattern {
            match self.read_by_pattern(page, pattern, field).await {
                Some(value) => {
                    return FieldOutcome {
                        field_name: field.name.clone(),
                        value: Some(value),
                        confidence: pattern.confidence,
                        error: None,
                        xpath: Some(pattern.xpath_pattern.clone()),
                        xpath_candidates: Vec::new(),
                    }
                }
                None => debug!("template missed '{}' on {url}", field.name),
            }
        }

        // Required fields earn the fallback learning path; optional misses
        // are just recorded
        if field.required {
            if let Some(llm) = self.llm {
                info!("learning fallback for required field '{}' on {url}", field.name);
                let mut executor = ActionExecutor::new(
                    self.browser,
                    SharedPage::clone(page),
                    Duration::from_millis(self.config.browser.step_timeout_ms),
                );
                return learn_field_on_page(&mut executor, llm, field, self.config).await;
            }
        }

        FieldOutcome::missing(
            &field.name,
            if pattern.is_some() {
                "template matched nothing"
            } else {
                "no template for field"
            },
        )
    }

    /// Read a field through its template: inner text, or the URL-bearing
    /// attribute for url fields, whitespace-stripped
    async fn read_by_pattern(
        &self,
        page: &SharedPage,
        pattern: &CommonFieldXPath,
        field: &FieldDefinition,
    ) -> Option<String> {
        let selector = format!("xpath={}", pattern.xpath_pattern);
        let prefer_url = field.data_type == DataType::Url;
        let read = tokio::time::timeout(
            Duration::from_millis(self.config.extractor.field_timeout_ms),
            xpath::read_value(page.as_ref(), &selector, 0, prefer_url),
        )
        .await;
        match read {
            Ok(Ok(Some(value))) => {
                let value = value.trim().to_string();
                (!value.is_empty()).then_some(value)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                debug!("template read failed for '{}': {e}", field.name);
                None
            }
            Err(_) => {
                debug!("template read timed out for '{}'", field.name);
                None
            }
        }
    }
}

/// Convenience: the extraction-config artifact shape (field → template)
#[must_use]
pub fn to_extraction_config(task: &Task, patterns: &[CommonFieldXPath]) -> serde_json::Value {
    let fields: Vec<serde_json::Value> = task
        .fields
        .iter()
        .map(|field| {
            let pattern = patterns.iter().find(|p| p.field_name == field.name);
            serde_json::json!({
                "name": field.name,
                "description": field.description,
                "required": field.required,
                "data_type": field.data_type,
                "xpath": pattern.map(|p| p.xpath_pattern.clone()),
                "confidence": pattern.map(|p| p.confidence),
                "validated": pattern.map(|p| p.validated).unwrap_or(false),
            })
        })
        .collect();
    serde_json::json!({ "fields": fields })
}
