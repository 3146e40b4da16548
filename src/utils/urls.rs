//! URL helpers: href resolution and pagination-parameter detection

use url::Url;

/// Query keys commonly used for the page number, in detection order
pub const PAGE_PARAM_KEYS: [&str; 6] = ["page", "p", "pageNum", "pageNo", "pn", "offset"];

/// Resolve a possibly-relative href against a base page URL
#[must_use]
pub fn resolve_href(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") || href == "#" {
        return None;
    }
    let base = Url::parse(base).ok()?;
    let joined = base.join(href).ok()?;
    if !matches!(joined.scheme(), "http" | "https") {
        return None;
    }
    Some(joined.to_string())
}

/// Detect which (if any) of the standard page-number keys the list URL uses
#[must_use]
pub fn detect_page_param(list_url: &str) -> Option<String> {
    let parsed = Url::parse(list_url).ok()?;
    let present: Vec<String> = parsed.query_pairs().map(|(k, _)| k.into_owned()).collect();
    PAGE_PARAM_KEYS
        .iter()
        .find(|key| present.iter().any(|k| k == *key))
        .map(|key| (*key).to_string())
}

/// Rebuild the list URL with the page parameter set to `target_page`
#[must_use]
pub fn rewrite_page_param(list_url: &str, param: &str, target_page: u32) -> Option<String> {
    let parsed = Url::parse(list_url).ok()?;
    let mut rebuilt = parsed.clone();
    {
        let mut pairs = rebuilt.query_pairs_mut();
        pairs.clear();
        for (k, v) in parsed.query_pairs() {
            if k == param {
                pairs.append_pair(&k, &target_page.to_string());
            } else {
                pairs.append_pair(&k, &v);
            }
        }
    }
    Some(rebuilt.to_string())
}

/// Read the page parameter back off a landed URL, for jump verification
#[must_use]
pub fn read_page_param(current_url: &str, param: &str) -> Option<u32> {
    let parsed = Url::parse(current_url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == param)
        .and_then(|(_, v)| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_href() {
        assert_eq!(
            resolve_href("https://example.com/list?page=1", "/detail/42").as_deref(),
            Some("https://example.com/detail/42")
        );
    }

    #[test]
    fn test_resolve_rejects_javascript() {
        assert!(resolve_href("https://example.com/", "javascript:void(0)").is_none());
        assert!(resolve_href("https://example.com/", "#").is_none());
    }

    #[test]
    fn test_detect_page_param() {
        assert_eq!(
            detect_page_param("https://example.com/list?page=3").as_deref(),
            Some("page")
        );
        assert_eq!(
            detect_page_param("https://example.com/list?pn=2&kw=x").as_deref(),
            Some("pn")
        );
        assert_eq!(detect_page_param("https://example.com/list?start=10"), None);
    }

    #[test]
    fn test_rewrite_and_read_back() {
        let rewritten = rewrite_page_param("https://example.com/list?page=1&kw=x", "page", 7)
            .expect("rewrite");
        assert_eq!(read_page_param(&rewritten, "page"), Some(7));
        assert!(rewritten.contains("kw=x"));
    }
}
