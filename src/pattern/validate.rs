//! Template validation against live pages
//!
//! A synthesized xpath earns `validated` only by extracting a unique,
//! type-valid value from sample pages. Hitting several distinct values means
//! the template is over-broad in practice no matter what the static rules
//! said; hitting none means it does not transfer.

use std::time::Duration;

use log::info;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::browser::{xpath, PageHandle};
use crate::llm::decisions::ValueVerdict;
use crate::llm::{chat_for_message, LlmClient};
use crate::task::{DataType, FieldDefinition};
use crate::utils::normalize_text;

/// Most matches inspected when checking value uniqueness
const MAX_VALUE_CANDIDATES: usize = 8;

static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\d\-+]*[-+]?\d[\d,.\s]*[^\d]*$").expect("static regex"));
static DATE_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"\d{4}[-/年]\d{1,2}([-/月]\d{1,2}日?)?").expect("static regex"),
        Regex::new(r"\d{1,2}[-/]\d{1,2}([-/]\d{2,4})?").expect("static regex"),
    ]
});

#[must_use]
pub fn looks_like_url(value: &str) -> bool {
    let value = value.trim();
    if value.starts_with('/') {
        return true;
    }
    match url::Url::parse(value) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
        }
        Err(_) => false,
    }
}

#[must_use]
pub fn looks_like_number(value: &str) -> bool {
    NUMBER_RE.is_match(value.trim())
}

#[must_use]
pub fn looks_like_date(value: &str) -> bool {
    let value = value.trim();
    DATE_RES.iter().any(|re| re.is_match(value))
}

/// Per-type sanity check on an extracted value
#[must_use]
pub fn is_type_valid(value: &str, data_type: DataType) -> bool {
    let text = value.trim();
    if text.is_empty() {
        return false;
    }
    match data_type {
        DataType::Url => looks_like_url(text),
        DataType::Number => looks_like_number(text),
        DataType::Date => looks_like_date(text),
        DataType::Text => true,
    }
}

const VALUE_VALIDATION_SYSTEM_PROMPT: &str = "\
You judge whether an extracted value semantically fits a field description. \
Reply with JSON only: {\"action\": \"validate\", \"args\": {\"is_valid\": \
true|false, \"normalized_value\": \"...\", \"reason\": \"...\"}}";

/// Validate one xpath pattern on one page.
///
/// Returns `(passed, value)`. Never errors; any failure is a `false`.
#[allow(clippy::too_many_arguments)]
pub async fn validate_xpath_pattern(
    page: &dyn PageHandle,
    url: &str,
    xpath_pattern: &str,
    expected_value: Option<&str>,
    field: &FieldDefinition,
    llm: Option<&dyn LlmClient>,
    timeout: Duration,
) -> (bool, Option<String>) {
    if page.goto(url, timeout).await.is_err() {
        return (false, None);
    }

    let selector = format!("xpath={xpath_pattern}");
    let matched = match xpath::count(page, &selector).await {
        Ok(0) | Err(_) => return (false, None),
        Ok(n) => n,
    };

    let prefer_url = field.data_type == DataType::Url;
    let mut unique_values: Vec<String> = Vec::new();
    for nth in 0..matched.min(MAX_VALUE_CANDIDATES) {
        let value = xpath::read_value(page, &selector, nth, prefer_url)
            .await
            .ok()
            .flatten();
        if let Some(value) = value {
            if !unique_values.contains(&value) {
                unique_values.push(value);
            }
        }
    }
    if unique_values.is_empty() {
        return (false, None);
    }

    // Uniqueness: several distinct normalized values mean the pattern spans
    // unrelated nodes
    let normalized: std::collections::HashSet<String> =
        unique_values.iter().map(|v| normalize_text(v)).collect();
    if normalized.len() != 1 {
        info!("pattern {xpath_pattern} hit {} distinct values, rejecting", normalized.len());
        return (false, None);
    }
    let selected = unique_values.remove(0);

    if let Some(expected) = expected_value {
        let expected_norm = normalize_text(expected);
        let actual_norm = normalize_text(&selected);
        let contained =
            expected_norm.contains(&actual_norm) || actual_norm.contains(&expected_norm);
        if !contained && strsim::normalized_levenshtein(&expected_norm, &actual_norm) < 0.7 {
            return (false, Some(selected));
        }
    }

    if !is_type_valid(&selected, field.data_type) {
        info!(
            "pattern {xpath_pattern} value failed type check for '{}': {}",
            field.name,
            selected.chars().take(80).collect::<String>()
        );
        return (false, None);
    }

    // Semantic fit, when an LLM is on hand
    if let Some(llm) = llm {
        let user = format!(
            "Field: {}\nDescription: {}\nType: {:?}\nPage: {url}\nXPath: {xpath_pattern}\nExtracted value: {selected}",
            field.name, field.description, field.data_type
        );
        match chat_for_message(llm, VALUE_VALIDATION_SYSTEM_PROMPT, &user, &[]).await {
            Ok(message) => {
                let verdict = ValueVerdict::from_message(&message, &selected);
                if !verdict.is_valid {
                    info!(
                        "semantic validation failed for '{}': {}",
                        field.name,
                        if verdict.reason.is_empty() { "no reason given" } else { &verdict.reason }
                    );
                    return (false, None);
                }
                return (true, Some(verdict.normalized_value));
            }
            Err(_) => return (false, None),
        }
    }

    (true, Some(selected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_check() {
        assert!(looks_like_url("https://example.com/detail/1"));
        assert!(looks_like_url("/detail/1"));
        assert!(!looks_like_url("not a url"));
        assert!(!looks_like_url("ftp://example.com/x"));
    }

    #[test]
    fn test_number_check() {
        assert!(looks_like_number("1,234.56"));
        assert!(looks_like_number("¥ 1200 元"));
        assert!(looks_like_number("-42"));
        assert!(!looks_like_number("no digits here"));
    }

    #[test]
    fn test_date_check() {
        assert!(looks_like_date("2026-07-31"));
        assert!(looks_like_date("2026年7月31日"));
        assert!(looks_like_date("07/31/2026"));
        assert!(!looks_like_date("sometime soon"));
    }

    #[test]
    fn test_type_valid_dispatch() {
        assert!(is_type_valid("2026-01-02", DataType::Date));
        assert!(!is_type_valid("", DataType::Text));
        assert!(is_type_valid("anything", DataType::Text));
        assert!(!is_type_valid("tomorrow", DataType::Date));
    }
}
