//! Text normalization and fuzzy comparison
//!
//! Vision models read text more reliably than integer ids, so much of the
//! pipeline hinges on comparing an LLM-claimed string against DOM text. All
//! comparisons happen on NFKC-normalized, whitespace-collapsed, lowercased
//! forms.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Decorative characters stripped before similarity scoring. These show up
/// around CJK link texts and never carry identity.
static DECORATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[【】\[\]()（）《》<>「」『』""''·•\-—_=+]"#).expect("static regex")
});

/// NFKC-normalize, collapse internal whitespace, trim, lowercase
#[must_use]
pub fn normalize_text(text: &str) -> String {
    let nfkc: String = text.nfkc().collect();
    WHITESPACE_RE
        .replace_all(&nfkc, " ")
        .trim()
        .to_lowercase()
}

/// Normalized form with all whitespace removed, for short-text equality
#[must_use]
pub fn strip_whitespace(text: &str) -> String {
    normalize_text(text).split_whitespace().collect()
}

fn strip_decorations(text: &str) -> String {
    DECORATION_RE.replace_all(text, "").into_owned()
}

/// Extract coarse keywords: CJK runs of 2-4 chars, latin words ≥3 chars,
/// digit runs ≥4 chars
fn keywords(text: &str) -> Vec<String> {
    static CJK_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"[\u{4e00}-\u{9fff}]{2,4}").expect("static regex"));
    static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-zA-Z]{3,}").expect("static regex"));
    static NUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4,}").expect("static regex"));

    let mut out = Vec::new();
    for re in [&*CJK_RE, &*WORD_RE, &*NUM_RE] {
        out.extend(re.find_iter(text).map(|m| m.as_str().to_lowercase()));
    }
    out
}

/// Similarity between an LLM-claimed text and an element's effective text.
///
/// Equality scores 1.0. Containment scores by length ratio, boosted to ≥0.85
/// when one side is a ≥5-char prefix of the other (the model returned a
/// truncated label). Otherwise a Levenshtein ratio blended 60/40 with
/// keyword overlap.
#[must_use]
pub fn text_similarity(claimed: &str, actual: &str) -> f64 {
    if claimed.is_empty() || actual.is_empty() {
        return 0.0;
    }

    let a = strip_decorations(&normalize_text(claimed));
    let b = strip_decorations(&normalize_text(actual));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    if a.contains(&b) || b.contains(&a) {
        let shorter = a.chars().count().min(b.chars().count());
        let longer = a.chars().count().max(b.chars().count());
        let length_ratio = shorter as f64 / longer as f64;
        let prefix_len_ok = shorter >= 5;
        if prefix_len_ok && (b.starts_with(&a) || a.starts_with(&b)) {
            return length_ratio.max(0.85);
        }
        return length_ratio;
    }

    let ratio = strsim::normalized_levenshtein(&a, &b);

    let ka: std::collections::HashSet<_> = keywords(&a).into_iter().collect();
    let kb: std::collections::HashSet<_> = keywords(&b).into_iter().collect();
    if !ka.is_empty() && !kb.is_empty() {
        let intersection = ka.intersection(&kb).count() as f64;
        let union = ka.union(&kb).count() as f64;
        let overlap = if union > 0.0 { intersection / union } else { 0.0 };
        return ratio * 0.6 + overlap * 0.4;
    }

    ratio
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize_text("  Hello\n\t World  "), "hello world");
    }

    #[test]
    fn test_normalize_nfkc_fullwidth() {
        // Fullwidth latin folds to ASCII under NFKC
        assert_eq!(normalize_text("Ｎｅｘｔ"), "next");
    }

    #[test]
    fn test_strip_whitespace() {
        assert_eq!(strip_whitespace("下 一 页"), "下一页");
    }

    #[test]
    fn test_similarity_equal() {
        assert_eq!(text_similarity("查看详情", "查看详情"), 1.0);
    }

    #[test]
    fn test_similarity_prefix_truncation() {
        let sim = text_similarity("Annual procurement notice", "Annual procurement notice for 2026 road works");
        assert!(sim >= 0.85, "prefix match should score high, got {sim}");
    }

    #[test]
    fn test_similarity_disjoint() {
        assert!(text_similarity("previous", "下一页") < 0.4);
    }

    #[test]
    fn test_similarity_empty() {
        assert_eq!(text_similarity("", "anything"), 0.0);
    }
}
