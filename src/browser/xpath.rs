//! Selector operations over a [`PageHandle`]
//!
//! Thin wrappers that build a query payload, evaluate it in the page, and
//! decode the op-specific result. Selectors starting with `/`, `(` or
//! `xpath=` are treated as XPath; everything else as CSS.

use serde_json::{json, Value};

use crate::error::{SpiderError, SpiderResult};

use super::js;
use super::PageHandle;

/// A selector plus its resolution kind
#[derive(Debug, Clone)]
pub struct Selector {
    pub kind: &'static str,
    pub value: String,
}

impl Selector {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Some(stripped) = trimmed.strip_prefix("xpath=") {
            return Self {
                kind: "xpath",
                value: stripped.trim().to_string(),
            };
        }
        if trimmed.starts_with('/') || trimmed.starts_with('(') {
            return Self {
                kind: "xpath",
                value: trimmed.to_string(),
            };
        }
        Self {
            kind: "css",
            value: trimmed.to_string(),
        }
    }
}

async fn run_op(
    page: &dyn PageHandle,
    selector: &str,
    op: &str,
    nth: usize,
    arg: Option<&str>,
    limit: Option<usize>,
) -> SpiderResult<Value> {
    let parsed = Selector::parse(selector);
    let payload = json!({
        "kind": parsed.kind,
        "selector": parsed.value,
        "op": op,
        "nth": nth,
        "arg": arg,
        "limit": limit,
    });
    page.evaluate(&js::query_script(&payload)).await
}

/// Number of nodes the selector matches
pub async fn count(page: &dyn PageHandle, selector: &str) -> SpiderResult<usize> {
    let value = run_op(page, selector, "count", 0, None, None).await?;
    Ok(value.as_u64().unwrap_or(0) as usize)
}

/// Whether the nth match is visible
pub async fn is_visible(page: &dyn PageHandle, selector: &str, nth: usize) -> SpiderResult<bool> {
    let value = run_op(page, selector, "visible", nth, None, None).await?;
    Ok(value.as_bool().unwrap_or(false))
}

/// innerText of the nth match
pub async fn inner_text(
    page: &dyn PageHandle,
    selector: &str,
    nth: usize,
) -> SpiderResult<Option<String>> {
    let value = run_op(page, selector, "text", nth, None, None).await?;
    Ok(value.as_str().map(str::to_string))
}

/// innerText of the first `limit` matches
pub async fn texts(
    page: &dyn PageHandle,
    selector: &str,
    limit: usize,
) -> SpiderResult<Vec<String>> {
    let value = run_op(page, selector, "texts", 0, None, Some(limit)).await?;
    Ok(decode_string_array(value))
}

/// One attribute of the nth match
pub async fn attribute(
    page: &dyn PageHandle,
    selector: &str,
    attr: &str,
    nth: usize,
) -> SpiderResult<Option<String>> {
    let value = run_op(page, selector, "attr", nth, Some(attr), None).await?;
    Ok(value.as_str().map(str::to_string))
}

/// One attribute across the first `limit` matches (None per missing)
pub async fn attributes(
    page: &dyn PageHandle,
    selector: &str,
    attr: &str,
    limit: usize,
) -> SpiderResult<Vec<Option<String>>> {
    let value = run_op(page, selector, "attrs", 0, Some(attr), Some(limit)).await?;
    let Value::Array(items) = value else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect())
}

/// Lowercased tag name of the nth match
pub async fn tag_name(
    page: &dyn PageHandle,
    selector: &str,
    nth: usize,
) -> SpiderResult<Option<String>> {
    let value = run_op(page, selector, "tag", nth, None, None).await?;
    Ok(value.as_str().map(str::to_string))
}

/// Click the nth match. False when the element is missing or hidden.
pub async fn click(page: &dyn PageHandle, selector: &str, nth: usize) -> SpiderResult<bool> {
    let value = run_op(page, selector, "click", nth, None, None).await?;
    Ok(value.as_bool().unwrap_or(false))
}

/// Fill the nth match with text, firing input/change events
pub async fn fill(
    page: &dyn PageHandle,
    selector: &str,
    text: &str,
    nth: usize,
) -> SpiderResult<bool> {
    let value = run_op(page, selector, "fill", nth, Some(text), None).await?;
    Ok(value.as_bool().unwrap_or(false))
}

/// Read a value preferring URL-bearing attributes (href, src, data-href)
/// over innerText, the way url-typed fields are read
pub async fn read_value(
    page: &dyn PageHandle,
    selector: &str,
    nth: usize,
    prefer_url: bool,
) -> SpiderResult<Option<String>> {
    if prefer_url {
        for attr in ["href", "src", "data-href"] {
            if let Some(v) = attribute(page, selector, attr, nth).await? {
                let v = v.trim().to_string();
                if !v.is_empty() {
                    return Ok(Some(v));
                }
            }
        }
    }
    let text = inner_text(page, selector, nth).await?;
    Ok(text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()))
}

fn decode_string_array(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Require a unique, visible match for a selector
pub async fn unique_visible(page: &dyn PageHandle, selector: &str) -> SpiderResult<bool> {
    Ok(count(page, selector).await? == 1 && is_visible(page, selector, 0).await?)
}

/// Map a browser failure into the standard error kind with context
#[must_use]
pub fn browser_err(context: &str, detail: impl std::fmt::Display) -> SpiderError {
    SpiderError::Browser(format!("{context}: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_parse_xpath_prefixed() {
        let s = Selector::parse("xpath=//div[@id='x']/a");
        assert_eq!(s.kind, "xpath");
        assert_eq!(s.value, "//div[@id='x']/a");
    }

    #[test]
    fn test_selector_parse_bare_xpath() {
        assert_eq!(Selector::parse("//section//a").kind, "xpath");
        assert_eq!(Selector::parse("(//a)[1]").kind, "xpath");
    }

    #[test]
    fn test_selector_parse_css() {
        let s = Selector::parse("a[rel=\"next\"]");
        assert_eq!(s.kind, "css");
    }
}
