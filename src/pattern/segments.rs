//! XPath segment parsing
//!
//! A segment is one step of a path: its separator (`/` or `//`), tag,
//! optional numeric position index, and attribute predicates. The
//! synthesizer folds xpaths segment by segment, so parsing fidelity matters
//! more than XPath completeness; expressions beyond this grammar simply
//! produce no segments and are excluded from merging.

use once_cell::sync::Lazy;
use regex::Regex;

/// One parsed path step
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Original text of the step, predicates included
    pub raw: String,
    pub tag: String,
    /// Numeric position predicate, when present
    pub index: Option<u32>,
    /// Attribute predicates, brackets included (e.g. `[@id='x']`)
    pub attrs: Vec<String>,
    /// `/` or `//`
    pub separator: String,
}

static SEGMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(//?)([a-zA-Z*][\w-]*)((?:\[[^\]]+\])*)").expect("static regex")
});
static PREDICATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]").expect("static regex"));
static NUMERIC_INDEX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\d+\]").expect("static regex"));

/// Parse an xpath into segments
#[must_use]
pub fn parse_xpath_segments(xpath: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    for caps in SEGMENT_RE.captures_iter(xpath) {
        let separator = caps[1].to_string();
        let tag = caps[2].to_string();
        let predicates_raw = caps.get(3).map_or("", |m| m.as_str());

        let mut index = None;
        let mut attrs = Vec::new();
        for pred in PREDICATE_RE.captures_iter(predicates_raw) {
            let body = pred[1].trim();
            if let Ok(n) = body.parse::<u32>() {
                index = Some(n);
            } else {
                attrs.push(format!("[{body}]"));
            }
        }

        segments.push(Segment {
            raw: caps[0].to_string(),
            tag,
            index,
            attrs,
            separator,
        });
    }
    segments
}

/// Strip numeric position indices, keeping attribute predicates. Two xpaths
/// with the same normalized form differ only in which row they point at.
#[must_use]
pub fn normalize_for_comparison(xpath: &str) -> String {
    NUMERIC_INDEX_RE.replace_all(xpath, "").into_owned()
}

/// Render a segment back to text
#[must_use]
pub fn render_segment(
    separator: &str,
    tag: &str,
    index: Option<u32>,
    attrs: &[String],
) -> String {
    let mut out = format!("{separator}{tag}");
    if let Some(n) = index {
        out.push_str(&format!("[{n}]"));
    }
    for attr in attrs {
        out.push_str(attr);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_path() {
        let segments = parse_xpath_segments("//div/ul/li[3]/a");
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0].separator, "//");
        assert_eq!(segments[0].tag, "div");
        assert_eq!(segments[2].index, Some(3));
        assert_eq!(segments[3].tag, "a");
        assert_eq!(segments[3].index, None);
    }

    #[test]
    fn test_parse_attribute_predicates() {
        let segments = parse_xpath_segments("//*[@id='main']/div[2][@class='row']/a");
        assert_eq!(segments[0].tag, "*");
        assert_eq!(segments[0].attrs, vec!["[@id='main']".to_string()]);
        assert_eq!(segments[1].index, Some(2));
        assert_eq!(segments[1].attrs, vec!["[@class='row']".to_string()]);
    }

    #[test]
    fn test_normalize_strips_only_numeric() {
        assert_eq!(
            normalize_for_comparison("//div[1]/ul/li[5]/a[@class='x']"),
            "//div/ul/li/a[@class='x']"
        );
    }

    #[test]
    fn test_render_roundtrip() {
        assert_eq!(
            render_segment("//", "li", Some(2), &["[@class='item']".to_string()]),
            "//li[2][@class='item']"
        );
    }
}
