//! Fuzzy text-to-xpath resolution
//!
//! Given a value the model read off the page, find the DOM node that carries
//! it and build ranked xpath candidates for it. Text fields walk the text
//! nodes; url fields match href/src/content attributes. The in-page walker
//! prefilters by loose containment; exact scoring happens here with the same
//! similarity the resolver uses.

use serde::Deserialize;

use crate::browser::PageHandle;
use crate::error::{SpiderError, SpiderResult};
use crate::pattern::stability_score;
use crate::som::snapshot::{BoundingBox, XPathCandidate};
use crate::task::DataType;
use crate::utils::text::{normalize_text, text_similarity};

/// One DOM node that plausibly carries the target value
#[derive(Debug, Clone, Deserialize)]
pub struct TextMatch {
    pub text: String,
    pub tag: String,
    pub bbox: BoundingBox,
    pub xpath_candidates: Vec<XPathCandidate>,
    /// Similarity to the target, filled in after scoring
    #[serde(default)]
    pub score: f64,
}

/// Walker over text-bearing leaf nodes. The needle is compared against each
/// node's own text, lowercased and whitespace-collapsed; candidate xpaths
/// mirror the scanner's strategies.
const TEXT_WALK_JS: &str = r#"
((needle) => {
    const norm = (s) => (s || '').replace(/\s+/g, ' ').trim().toLowerCase();
    const target = norm(needle);
    if (!target) return [];

    const indexAmong = (el) => {
        let i = 1, sib = el.previousElementSibling;
        while (sib) { if (sib.tagName === el.tagName) i++; sib = sib.previousElementSibling; }
        return i;
    };
    const absolute = (el) => {
        const parts = [];
        let node = el;
        while (node && node.nodeType === 1 && node !== document.documentElement) {
            parts.unshift(node.tagName.toLowerCase() + '[' + indexAmong(node) + ']');
            node = node.parentElement;
        }
        return '/html/' + parts.join('/');
    };
    const relFrom = (anc, el) => {
        const parts = [];
        let node = el;
        while (node && node !== anc) {
            parts.unshift(node.tagName.toLowerCase() + '[' + indexAmong(node) + ']');
            node = node.parentElement;
        }
        return parts.join('/');
    };
    const stableClass = (el) => {
        const cls = (el.getAttribute && el.getAttribute('class')) || '';
        for (const t of cls.split(/\s+/)) {
            if (t && t.length >= 3 && !/^\d+$/.test(t) && !/\d{5,}/.test(t)) return t;
        }
        return null;
    };
    const candidates = (el) => {
        const out = [];
        const tag = el.tagName.toLowerCase();
        if (el.id && !/\d{5,}/.test(el.id)) {
            out.push({ xpath: `//*[@id='${el.id}']`, priority: 1, strategy: 'id', confidence: 0.95 });
        }
        let anc = el.parentElement;
        while (anc && anc !== document.body) {
            if (anc.id && !/\d{5,}/.test(anc.id)) break;
            anc = anc.parentElement;
        }
        if (anc && anc.id) {
            out.push({ xpath: `//*[@id='${anc.id}']/` + relFrom(anc, el),
                       priority: 3, strategy: 'id-relative', confidence: 0.85 });
        }
        const cls = stableClass(el);
        if (cls) {
            out.push({ xpath: `//${tag}[contains(@class, '${cls}')]`,
                       priority: 5, strategy: 'class-anchor', confidence: 0.6 });
        }
        for (const attr of el.attributes) {
            if (attr.name.startsWith('data-') && attr.name !== 'data-som-id' && attr.value) {
                out.push({ xpath: `//${tag}[@${attr.name}='${attr.value}']`,
                           priority: 6, strategy: 'data-attr', confidence: 0.6 });
                break;
            }
        }
        out.push({ xpath: absolute(el), priority: 7, strategy: 'absolute', confidence: 0.4 });
        return out;
    };

    const results = [];
    const seen = new Set();
    const walker = document.createTreeWalker(document.body, NodeFilter.SHOW_TEXT);
    let node;
    while ((node = walker.nextNode()) && results.length < 40) {
        const text = norm(node.textContent);
        if (!text || text.length > 500) continue;
        if (!text.includes(target) && !target.includes(text)) continue;
        const el = node.parentElement;
        if (!el || seen.has(el)) continue;
        seen.add(el);
        const rect = el.getBoundingClientRect();
        results.push({
            text: (node.textContent || '').trim(),
            tag: el.tagName.toLowerCase(),
            bbox: { x: rect.x, y: rect.y, width: rect.width, height: rect.height },
            xpath_candidates: candidates(el)
        });
    }
    return results;
})(__NEEDLE__)
"#;

/// Walker over URL-bearing attributes for url-typed fields
const ATTR_WALK_JS: &str = r#"
((needle) => {
    const target = (needle || '').trim();
    if (!target) return [];

    const indexAmong = (el) => {
        let i = 1, sib = el.previousElementSibling;
        while (sib) { if (sib.tagName === el.tagName) i++; sib = sib.previousElementSibling; }
        return i;
    };
    const absolute = (el) => {
        const parts = [];
        let node = el;
        while (node && node.nodeType === 1 && node !== document.documentElement) {
            parts.unshift(node.tagName.toLowerCase() + '[' + indexAmong(node) + ']');
            node = node.parentElement;
        }
        return '/html/' + parts.join('/');
    };

    const results = [];
    for (const el of document.querySelectorAll('[href], [src], [data-href], [content]')) {
        if (results.length >= 40) break;
        const value = el.getAttribute('href') || el.getAttribute('src')
            || el.getAttribute('data-href') || el.getAttribute('content') || '';
        if (!value) continue;
        if (!value.includes(target) && !target.includes(value)) continue;
        const rect = el.getBoundingClientRect ? el.getBoundingClientRect()
            : { x: 0, y: 0, width: 0, height: 0 };
        const out = [];
        const tag = el.tagName.toLowerCase();
        if (el.id && !/\d{5,}/.test(el.id)) {
            out.push({ xpath: `//*[@id='${el.id}']`, priority: 1, strategy: 'id', confidence: 0.95 });
        }
        out.push({ xpath: absolute(el), priority: 7, strategy: 'absolute', confidence: 0.4 });
        results.push({
            text: value,
            tag: tag,
            bbox: { x: rect.x, y: rect.y, width: rect.width, height: rect.height },
            xpath_candidates: out
        });
    }
    return results;
})(__NEEDLE__)
"#;

/// Find DOM nodes whose text (or URL attribute) matches `target` above
/// `threshold`, best first
pub async fn find_text_matches(
    page: &dyn PageHandle,
    target: &str,
    data_type: DataType,
    threshold: f64,
) -> SpiderResult<Vec<TextMatch>> {
    let needle = serde_json::to_string(target)
        .map_err(|e| SpiderError::Browser(format!("needle encode: {e}")))?;
    let script = if data_type == DataType::Url {
        ATTR_WALK_JS.replace("__NEEDLE__", &needle)
    } else {
        TEXT_WALK_JS.replace("__NEEDLE__", &needle)
    };

    let value = page.evaluate(&script).await?;
    let mut matches: Vec<TextMatch> = serde_json::from_value(value)
        .map_err(|e| SpiderError::Browser(format!("text walk parse: {e}")))?;

    for candidate in &mut matches {
        candidate.score = if data_type == DataType::Url {
            score_url_match(&candidate.text, target)
        } else {
            text_similarity(target, &candidate.text)
        };
    }
    matches.retain(|m| m.score >= threshold);
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(matches)
}

/// URL attributes match on containment and suffix agreement rather than
/// edit distance; query strings and hosts drift
fn score_url_match(candidate: &str, target: &str) -> f64 {
    let candidate = candidate.trim();
    let target = target.trim();
    if candidate == target {
        return 1.0;
    }
    if candidate.ends_with(target) || target.ends_with(candidate) {
        return 0.9;
    }
    if candidate.contains(target) || target.contains(candidate) {
        return 0.8;
    }
    strsim::normalized_levenshtein(&normalize_text(candidate), &normalize_text(target))
}

/// Order a match's candidates by the synthesizer's stability score, so the
/// learned xpath prefers id anchors over absolute paths
#[must_use]
pub fn rank_candidates(mut candidates: Vec<XPathCandidate>) -> Vec<XPathCandidate> {
    candidates.sort_by(|a, b| {
        stability_score(&b.xpath)
            .partial_cmp(&stability_score(&a.xpath))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.priority.cmp(&b.priority))
    });
    candidates
}

/// Tags that are interactive chrome rather than content; a non-url field
/// resolved onto one of these is a mislocated value
#[must_use]
pub fn is_interactive_only_tag(tag: &str) -> bool {
    matches!(tag, "button" | "nav" | "select" | "option" | "input" | "textarea")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::som::snapshot::XPathStrategy;

    fn candidate(xpath: &str, priority: u32) -> XPathCandidate {
        XPathCandidate {
            xpath: xpath.into(),
            priority,
            strategy: XPathStrategy::Absolute,
            confidence: 0.5,
        }
    }

    #[test]
    fn test_rank_prefers_id_anchor() {
        let ranked = rank_candidates(vec![
            candidate("/html/body[1]/div[3]/span[1]", 7),
            candidate("//*[@id='info']/span[1]", 3),
        ]);
        assert_eq!(ranked[0].xpath, "//*[@id='info']/span[1]");
    }

    #[test]
    fn test_url_scoring() {
        assert_eq!(score_url_match("/detail/42", "/detail/42"), 1.0);
        assert!(score_url_match("https://example.com/detail/42", "/detail/42") >= 0.9);
        assert!(score_url_match("/other/1", "/detail/42") < 0.8);
    }

    #[test]
    fn test_interactive_only_tags() {
        assert!(is_interactive_only_tag("button"));
        assert!(!is_interactive_only_tag("td"));
        assert!(!is_interactive_only_tag("a"));
    }
}
