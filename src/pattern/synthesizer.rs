//! Common-XPath induction
//!
//! Given the per-visit xpaths of the same logical element across several
//! pages, produce one template that matches all of them without becoming
//! over-broad. Merging strategies, in the order tried: multi-strategy
//! candidate groups, segment-wise smart fold, suffix alignment, dominant
//! exact template, two-template union, and finally an LLM ask — each result
//! gated by the over-broad rules and ranked by a stability score.

use std::collections::HashMap;

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::llm::{parse_json_object, LlmClient};
use crate::som::snapshot::{XPathCandidate, XPathStrategy};

use super::segments::{normalize_for_comparison, parse_xpath_segments, render_segment, Segment};

/// A synthesized template plus its confidence against the sources
#[derive(Debug, Clone)]
pub struct SynthesizedPattern {
    pub pattern: String,
    pub confidence: f64,
}

/// Class tokens that churn with UI state and never anchor a template
const NOISE_CLASS_TOKENS: [&str; 16] = [
    "active", "hover", "focus", "selected", "open", "show", "hide", "col", "row", "first",
    "last", "odd", "even", "clearfix", "disabled", "current",
];

/// Tokens that mark floating or overlay chrome; penalised in scoring
const VOLATILE_TOKENS: [&str; 7] = ["fixed", "sticky", "float", "popup", "modal", "dialog", "mask"];

static NUMERIC_INDEX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\d+\]").expect("static regex"));
static ANCHOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)@id\s*=|@class\s*=|contains\(\s*@class|@data-[\w-]+\s*=|contains\(\s*@data-")
        .expect("static regex")
});
static CONTAINS_CLASS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)contains\(\s*@class\s*,\s*['"]([^'"]+)['"]"#).expect("static regex")
});
static CLASS_EQ_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)@class\s*=\s*['"]([^'"]+)['"]"#).expect("static regex"));
static LONG_DIGIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{5,}").expect("static regex"));
static HEXISH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9a-f]{8,}").expect("static regex"));

/// Stability score: higher means more reusable across pages
#[must_use]
pub fn stability_score(xpath: &str) -> f64 {
    let value = xpath.trim();
    if value.is_empty() {
        return -10.0;
    }
    let lower = value.to_lowercase();
    let mut score = 0.0;

    if lower.contains("@id=") {
        score += 3.0;
    }
    if lower.contains("@data-") {
        score += 1.8;
    }
    if lower.contains("@class") {
        score += 0.8;
    }
    if lower.starts_with("//*[@id=") {
        score += 0.5;
    }

    let numeric_indices = NUMERIC_INDEX_RE.find_iter(value).count();
    score -= numeric_indices as f64 * 0.2;

    let depth = value.matches('/').count();
    if depth > 10 {
        score -= (depth - 10) as f64 * 0.08;
    }

    if VOLATILE_TOKENS.iter().any(|t| lower.contains(t)) {
        score -= 1.8;
    }

    if value.contains('|') {
        score -= 0.6;
    }

    score
}

/// Whether a class token is stable enough to anchor a template
#[must_use]
pub fn is_stable_class_token(token: &str) -> bool {
    let token = token.trim();
    if token.len() < 3 || token.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    if NOISE_CLASS_TOKENS.contains(&token.to_lowercase().as_str()) {
        return false;
    }
    if LONG_DIGIT_RE.is_match(token) || HEXISH_RE.is_match(&token.to_lowercase()) {
        return false;
    }
    true
}

fn is_single_over_broad(xpath: &str) -> bool {
    let value = xpath.trim();
    if value.is_empty() || !value.starts_with('/') {
        return true;
    }

    // `//*` is allowed only when immediately anchored by id/class/data-*
    let lower = value.to_lowercase();
    let mut search_from = 0;
    while let Some(pos) = lower[search_from..].find("//*") {
        let after = &lower[search_from + pos + 3..];
        let anchored = after.starts_with("[@id")
            || after.starts_with("[@class")
            || after.starts_with("[@data-")
            || after.starts_with("[contains(@class")
            || after.starts_with("[contains(@data-");
        if !anchored {
            return true;
        }
        search_from += pos + 3;
    }

    // A mid-path descendant axis without any attribute anchor matches far
    // beyond the intended subtree
    let has_descendant_axis = value.len() > 2 && value[2..].contains("//");
    let has_anchor = ANCHOR_RE.is_match(value);
    if has_descendant_axis && !has_anchor {
        return true;
    }

    lower.ends_with("//span") || lower.ends_with("//div") || lower.ends_with("//*")
}

/// Over-broad detection per the rules in the module docs. Union patterns are
/// over-broad when any member is.
#[must_use]
pub fn is_over_broad(xpath: &str) -> bool {
    let value = xpath.trim();
    if value.contains('|') {
        let parts: Vec<&str> = value.split('|').map(str::trim).filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            return true;
        }
        return parts.iter().any(|p| is_single_over_broad(p));
    }
    is_single_over_broad(value)
}

/// Blended confidence: 0.7·exact-match ratio + 0.3·normalized-match ratio
#[must_use]
pub fn pattern_confidence(source_xpaths: &[String], pattern: &str) -> f64 {
    if source_xpaths.is_empty() {
        return 0.0;
    }

    let (exact_set, normalized_set): (Vec<String>, Vec<String>) = if pattern.contains('|') {
        let parts: Vec<&str> = pattern.split('|').map(str::trim).filter(|p| !p.is_empty()).collect();
        (
            parts.iter().map(|p| (*p).to_string()).collect(),
            parts.iter().map(|p| normalize_for_comparison(p)).collect(),
        )
    } else {
        (
            vec![pattern.trim().to_string()],
            vec![normalize_for_comparison(pattern)],
        )
    };

    let mut exact = 0usize;
    let mut normalized = 0usize;
    for xpath in source_xpaths {
        let raw = xpath.trim();
        if exact_set.iter().any(|p| p == raw) {
            exact += 1;
        }
        if normalized_set
            .iter()
            .any(|p| *p == normalize_for_comparison(raw))
        {
            normalized += 1;
        }
    }

    let total = source_xpaths.len() as f64;
    (exact as f64 / total) * 0.7 + (normalized as f64 / total) * 0.3
}

/// Normalized-match ratio alone, the confidence the detail-link fold uses
#[must_use]
pub fn normalized_match_ratio(source_xpaths: &[String], pattern: &str) -> f64 {
    if source_xpaths.is_empty() {
        return 0.0;
    }
    let target = normalize_for_comparison(pattern);
    let matching = source_xpaths
        .iter()
        .filter(|x| normalize_for_comparison(x) == target)
        .count();
    matching as f64 / source_xpaths.len() as f64
}

static ANY_PREDICATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]+\]").expect("static regex"));

/// Tags-and-separators-only form: all predicates stripped. Used to gate the
/// smart fold, where dropped attributes and rescued class predicates make
/// the attribute-preserving normalized form unusable for comparison.
fn structural_form(xpath: &str) -> String {
    ANY_PREDICATE_RE.replace_all(xpath, "").into_owned()
}

fn structural_match_ratio(source_xpaths: &[String], pattern: &str) -> f64 {
    if source_xpaths.is_empty() {
        return 0.0;
    }
    let target = structural_form(pattern);
    let matching = source_xpaths
        .iter()
        .filter(|x| structural_form(x) == target)
        .count();
    matching as f64 / source_xpaths.len() as f64
}

fn merge_attributes(all_attrs: &[&Vec<String>]) -> Vec<String> {
    let Some(first) = all_attrs.first() else {
        return Vec::new();
    };
    if first.is_empty() {
        return Vec::new();
    }
    let mut common: Vec<String> = first
        .iter()
        .filter(|attr| all_attrs.iter().all(|attrs| attrs.contains(attr)))
        .cloned()
        .collect();
    common.sort();
    common.dedup();
    common
}

/// When the index was dropped and no attribute survived, look for a class
/// token shared by ≥60% of the inputs at this position
fn rescue_class_for_position(all_segments: &[Vec<Segment>], seg_idx: usize) -> Option<String> {
    let mut found: Vec<String> = Vec::new();
    for segments in all_segments {
        let Some(segment) = segments.get(seg_idx) else {
            continue;
        };
        let mut class_token = None;
        for attr in &segment.attrs {
            if let Some(caps) = CONTAINS_CLASS_RE.captures(attr) {
                let token = caps[1].trim().to_string();
                if is_stable_class_token(&token) {
                    class_token = Some(token);
                    break;
                }
            }
            if let Some(caps) = CLASS_EQ_RE.captures(attr) {
                if let Some(token) = caps[1].split_whitespace().find(|t| is_stable_class_token(t)) {
                    class_token = Some(token.to_string());
                    break;
                }
            }
        }
        if let Some(token) = class_token {
            found.push(token);
        }
    }
    if found.is_empty() {
        return None;
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for token in &found {
        *counts.entry(token.as_str()).or_default() += 1;
    }
    let (best, best_count) = counts.into_iter().max_by_key(|(_, n)| *n)?;
    let ratio = best_count as f64 / all_segments.len() as f64;
    if ratio < 0.6 {
        return None;
    }

    if !best.contains('\'') {
        Some(format!("[contains(@class, '{best}')]"))
    } else if !best.contains('"') {
        Some(format!("[contains(@class, \"{best}\")]"))
    } else {
        None
    }
}

/// Segment-wise fold of same-arity xpaths.
///
/// Tags must agree at every position. A numeric index survives only when
/// every input has one and ≥⅔ agree on its value; a dropped index with no
/// surviving predicates triggers the class rescue. Inputs whose arity
/// deviates from the majority are excluded before folding.
#[must_use]
pub fn smart_merge(xpaths: &[String]) -> Option<String> {
    if xpaths.len() < 2 {
        return xpaths.first().cloned();
    }

    let mut parsed: Vec<(String, Vec<Segment>)> = xpaths
        .iter()
        .map(|x| (x.clone(), parse_xpath_segments(x)))
        .filter(|(_, segments)| !segments.is_empty())
        .collect();
    if parsed.len() < 2 {
        return None;
    }

    // Majority arity wins; minority inputs are excluded
    let mut count_freq: HashMap<usize, usize> = HashMap::new();
    for (_, segments) in &parsed {
        *count_freq.entry(segments.len()).or_default() += 1;
    }
    let (&majority_len, _) = count_freq.iter().max_by_key(|(_, n)| **n)?;
    parsed.retain(|(_, segments)| segments.len() == majority_len);
    if parsed.len() < 2 {
        return None;
    }

    let all_segments: Vec<&Vec<Segment>> = parsed.iter().map(|(_, s)| s).collect();
    let mut result = String::new();
    // Fold without rescued predicates; the confidence gate runs against
    // this, since a rescued class predicate never appears in the sources
    let mut skeleton = String::new();

    for seg_idx in 0..majority_len {
        let position: Vec<&Segment> = all_segments.iter().map(|s| &s[seg_idx]).collect();

        let tag = &position[0].tag;
        if position.iter().any(|s| &s.tag != tag) {
            debug!("tag mismatch at position {seg_idx}, cannot fold");
            return None;
        }
        let separator = &position[0].separator;

        // Index retention: all inputs indexed and ≥2/3 share the value
        let indices: Vec<Option<u32>> = position.iter().map(|s| s.index).collect();
        let mut kept_index = None;
        if indices.iter().all(Option::is_some) {
            let mut freq: HashMap<u32, usize> = HashMap::new();
            for index in indices.iter().flatten() {
                *freq.entry(*index).or_default() += 1;
            }
            if let Some((&value, &count)) = freq.iter().max_by_key(|(_, n)| **n) {
                if count * 3 >= indices.len() * 2 {
                    kept_index = Some(value);
                }
            }
        }

        let attr_lists: Vec<&Vec<String>> = position.iter().map(|s| &s.attrs).collect();
        let mut common_attrs = merge_attributes(&attr_lists);
        skeleton.push_str(&render_segment(separator, tag, kept_index, &common_attrs));

        if kept_index.is_none() && common_attrs.is_empty() {
            if let Some(rescued) = rescue_class_for_position(
                &parsed.iter().map(|(_, s)| s.clone()).collect::<Vec<_>>(),
                seg_idx,
            ) {
                common_attrs.push(rescued);
            }
        }

        result.push_str(&render_segment(separator, tag, kept_index, &common_attrs));
    }

    if result.is_empty() {
        return None;
    }

    let kept_sources: Vec<String> = parsed.into_iter().map(|(x, _)| x).collect();
    let confidence = structural_match_ratio(&kept_sources, &skeleton);
    debug!("smart fold produced {result} (structural match {confidence:.2})");
    (confidence >= 0.5).then_some(result)
}

/// Align xpaths of differing depth on their longest tag-matching suffix.
///
/// With a shared attribute-anchored ancestor before the suffix the result is
/// `{anchor}//{suffix}`; otherwise `//{suffix}` but only for suffixes at
/// least two segments deep.
#[must_use]
pub fn suffix_aligned_merge(xpaths: &[String]) -> Option<String> {
    if xpaths.len() < 2 {
        return xpaths.first().cloned();
    }
    let all_segments: Vec<Vec<Segment>> =
        xpaths.iter().map(|x| parse_xpath_segments(x)).collect();
    if all_segments.iter().any(Vec::is_empty) {
        return None;
    }

    let min_len = all_segments.iter().map(Vec::len).min()?;
    let mut suffix_len = 0;
    for depth in 1..=min_len {
        let tag = &all_segments[0][all_segments[0].len() - depth].tag;
        if all_segments
            .iter()
            .all(|segments| &segments[segments.len() - depth].tag == tag)
        {
            suffix_len = depth;
        } else {
            break;
        }
    }
    if suffix_len < 1 {
        return None;
    }

    let mut suffix_parts = Vec::new();
    for depth in (1..=suffix_len).rev() {
        let position: Vec<&Segment> = all_segments
            .iter()
            .map(|segments| &segments[segments.len() - depth])
            .collect();
        let tag = &position[0].tag;

        let indices: Vec<Option<u32>> = position.iter().map(|s| s.index).collect();
        let kept_index = match indices.as_slice() {
            all if all.iter().all(Option::is_some) => {
                let first = all[0];
                all.iter().all(|i| *i == first).then(|| first).flatten()
            }
            _ => None,
        };

        let attr_lists: Vec<&Vec<String>> = position.iter().map(|s| &s.attrs).collect();
        let common_attrs = merge_attributes(&attr_lists);

        suffix_parts.push(format!(
            "{tag}{}{}",
            kept_index.map_or(String::new(), |n| format!("[{n}]")),
            common_attrs.join("")
        ));
    }
    let suffix_path = suffix_parts.join("/");

    // A shared attribute-anchored ancestor lets the suffix stay scoped
    let mut anchors = Vec::new();
    for segments in &all_segments {
        let prefix = &segments[..segments.len() - suffix_len];
        let anchor = prefix
            .iter()
            .rev()
            .find(|segment| !segment.attrs.is_empty())
            .map(|segment| {
                format!(
                    "{}{}{}",
                    segment.separator,
                    segment.tag,
                    segment.attrs.join("")
                )
            });
        anchors.push(anchor);
    }
    if anchors.iter().all(Option::is_some) {
        let first = anchors[0].clone();
        if anchors.iter().all(|a| *a == first) {
            return Some(format!("{}//{suffix_path}", first.unwrap_or_default()));
        }
    }

    (suffix_len >= 2).then(|| format!("//{suffix_path}"))
}

/// The most frequent exact xpath, when it covers ≥50% of the inputs.
/// Stability breaks frequency ties.
#[must_use]
pub fn dominant_exact(xpaths: &[String]) -> Option<String> {
    let cleaned: Vec<&str> = xpaths
        .iter()
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for xpath in &cleaned {
        *counts.entry(*xpath).or_default() += 1;
    }
    let top_count = *counts.values().max()?;
    if (top_count as f64 / cleaned.len() as f64) < 0.5 {
        return None;
    }

    counts
        .into_iter()
        .filter(|(_, n)| *n == top_count)
        .map(|(x, _)| x.to_string())
        .max_by(|a, b| {
            stability_score(a)
                .partial_cmp(&stability_score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// `a | b` for exactly two distinct templates that differ structurally
#[must_use]
pub fn union_pattern(xpaths: &[String]) -> Option<String> {
    let mut unique: Vec<&String> = Vec::new();
    for xpath in xpaths {
        if !unique.contains(&xpath) {
            unique.push(xpath);
        }
    }
    if unique.len() != 2 {
        return None;
    }
    let normalized: std::collections::HashSet<String> = unique
        .iter()
        .map(|x| normalize_for_comparison(x))
        .collect();
    // Same structure varying only by index is a fold problem, not a union
    if normalized.len() <= 1 {
        return None;
    }
    Some(format!("{} | {}", unique[0], unique[1]))
}

fn should_prefer_union(
    source_xpaths: &[String],
    current: Option<&str>,
    union: &str,
) -> bool {
    if is_over_broad(union) {
        return false;
    }
    let structures: std::collections::HashSet<String> = source_xpaths
        .iter()
        .map(|x| normalize_for_comparison(x))
        .collect();
    if structures.len() <= 1 {
        return false;
    }
    let union_conf = pattern_confidence(source_xpaths, union);
    if union_conf < 0.75 {
        return false;
    }
    match current {
        None => true,
        Some(current) => union_conf >= pattern_confidence(source_xpaths, current) + 0.25,
    }
}

/// Merge by strategy group: for each strategy (most stable first) that every
/// input has a candidate for, try exact agreement, then the smart fold, then
/// suffix alignment.
#[must_use]
pub fn merge_from_candidates(per_source_candidates: &[Vec<XPathCandidate>]) -> Option<String> {
    let valid: Vec<&Vec<XPathCandidate>> = per_source_candidates
        .iter()
        .filter(|candidates| !candidates.is_empty())
        .collect();
    if valid.len() < 2 {
        return None;
    }

    for strategy in XPathStrategy::PRIORITY_ORDER {
        let mut per_source: Vec<&str> = Vec::new();
        for candidates in &valid {
            match candidates.iter().find(|c| c.strategy == strategy) {
                Some(candidate) => per_source.push(&candidate.xpath),
                None => break,
            }
        }
        if per_source.len() < valid.len() {
            continue;
        }

        let first = per_source[0];
        if per_source.iter().all(|x| *x == first) {
            info!("strategy {strategy:?} agrees exactly: {first}");
            return Some(first.to_string());
        }

        let owned: Vec<String> = per_source.iter().map(|x| (*x).to_string()).collect();
        if let Some(pattern) = smart_merge(&owned) {
            if !is_over_broad(&pattern) {
                info!("strategy {strategy:?} folded to {pattern}");
                return Some(pattern);
            }
        }
        if let Some(pattern) = suffix_aligned_merge(&owned) {
            if !is_over_broad(&pattern) {
                info!("strategy {strategy:?} suffix-aligned to {pattern}");
                return Some(pattern);
            }
        }
    }
    None
}

/// Simple fold used for the detail-link template: smart fold, then the
/// normalized-majority fallback, gated at 0.6 normalized match
#[must_use]
pub fn fold_detail_xpath(xpaths: &[String]) -> Option<SynthesizedPattern> {
    if xpaths.len() < 2 {
        return None;
    }
    if let Some(pattern) = smart_merge(xpaths) {
        let confidence = normalized_match_ratio(xpaths, &pattern);
        if confidence >= 0.6 {
            return Some(SynthesizedPattern { pattern, confidence });
        }
    }

    // Majority normalized structure
    let mut counts: HashMap<String, usize> = HashMap::new();
    for xpath in xpaths {
        *counts.entry(normalize_for_comparison(xpath)).or_default() += 1;
    }
    let (pattern, count) = counts.into_iter().max_by_key(|(_, n)| *n)?;
    let confidence = count as f64 / xpaths.len() as f64;
    (confidence >= 0.6).then_some(SynthesizedPattern { pattern, confidence })
}

/// Full synthesizer, with an optional LLM for the last-resort ask
pub struct PatternSynthesizer<'a> {
    llm: Option<&'a dyn LlmClient>,
}

impl<'a> PatternSynthesizer<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self { llm: None }
    }

    #[must_use]
    pub fn with_llm(llm: &'a dyn LlmClient) -> Self {
        Self { llm: Some(llm) }
    }

    /// Induce a common template for one field across its per-page xpaths
    pub async fn synthesize(
        &self,
        field_name: &str,
        source_xpaths: &[String],
        per_source_candidates: &[Vec<XPathCandidate>],
    ) -> Option<SynthesizedPattern> {
        if source_xpaths.len() < 2 {
            debug!("not enough sources for '{field_name}' ({})", source_xpaths.len());
            return None;
        }

        let candidate_pattern = merge_from_candidates(per_source_candidates)
            .filter(|pattern| !is_over_broad(pattern));

        let rule_pattern = smart_merge(source_xpaths)
            .or_else(|| suffix_aligned_merge(source_xpaths).filter(|p| !is_over_broad(p)));
        let dominant = dominant_exact(source_xpaths);

        // Isomorphic variants (index-only differences): prefer the dominant
        // exact template over a flattened fold
        let structures: std::collections::HashSet<String> = source_xpaths
            .iter()
            .map(|x| normalize_for_comparison(x))
            .collect();
        let mut common = if structures.len() == 1 && dominant.is_some() {
            dominant.clone()
        } else {
            rule_pattern.clone().or_else(|| dominant.clone())
        };

        // Multi-strategy candidates win on stability
        if let Some(candidate) = &candidate_pattern {
            let candidate_score = stability_score(candidate);
            let current_score = common.as_deref().map_or(-10.0, stability_score);
            if candidate_score > current_score {
                common = Some(candidate.clone());
            }
        }

        // Union only for genuinely heterogeneous templates
        if let Some(union) = union_pattern(source_xpaths) {
            if should_prefer_union(source_xpaths, common.as_deref(), &union) {
                info!("heterogeneous templates for '{field_name}', using union");
                common = Some(union);
            }
        }

        // Rule merging failed or went over-broad: ask the LLM
        if common.as_deref().map_or(true, is_over_broad) {
            if let Some(llm) = self.llm {
                common = self
                    .generate_with_llm(llm, field_name, source_xpaths)
                    .await;
            }
        }

        // An over-broad LLM answer falls back by stability preference
        if let Some(pattern) = &common {
            if is_over_broad(pattern) {
                common = candidate_pattern
                    .filter(|p| !is_over_broad(p))
                    .or_else(|| {
                        union_pattern(source_xpaths).filter(|p| !is_over_broad(p))
                    })
                    .or_else(|| rule_pattern.clone().filter(|p| !is_over_broad(p)));
            }
        }

        let pattern = common?;
        let confidence = pattern_confidence(source_xpaths, &pattern);
        info!("common xpath for '{field_name}': {pattern} (confidence {confidence:.2})");
        Some(SynthesizedPattern { pattern, confidence })
    }

    async fn generate_with_llm(
        &self,
        llm: &dyn LlmClient,
        field_name: &str,
        source_xpaths: &[String],
    ) -> Option<String> {
        let listing: String = source_xpaths
            .iter()
            .enumerate()
            .map(|(i, x)| format!("{}. {x}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        let system = "You generalize XPath expressions. Given per-page xpaths \
            of the same logical field, produce one XPath that matches the \
            element on every page without matching unrelated nodes. Prefer \
            id/class anchors over positional indices. Reply with JSON only: \
            {\"xpath_pattern\": \"...\"}";
        let user = format!("Field: {field_name}\nSource xpaths:\n{listing}");

        let text = match llm.chat(system, &user, &[]).await {
            Ok(text) => text,
            Err(e) => {
                debug!("LLM common-xpath ask failed: {e}");
                return None;
            }
        };
        let map = parse_json_object(&text)?;
        let raw = map.get("xpath_pattern")?.as_str()?.trim();
        clean_llm_xpath(raw)
    }
}

impl Default for PatternSynthesizer<'_> {
    fn default() -> Self {
        Self::new()
    }
}

fn clean_llm_xpath(raw: &str) -> Option<String> {
    let mut xpath = raw.trim();
    if let Some(stripped) = xpath.strip_prefix("xpath=") {
        xpath = stripped.trim();
    }
    let xpath = xpath.trim_matches(|c| c == '\'' || c == '"').trim();
    xpath.starts_with('/').then(|| xpath.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_fold_drops_varying_index() {
        // Three visits landing on rows 1, 3, 5 of the same list
        let sources = strings(&[
            "//section//ul/li[1]/a",
            "//section//ul/li[3]/a",
            "//section//ul/li[5]/a",
        ]);
        let folded = fold_detail_xpath(&sources).expect("fold");
        assert_eq!(folded.pattern, "//section//ul/li/a");
        assert!(folded.confidence >= 0.9, "got {}", folded.confidence);
    }

    #[test]
    fn test_fold_keeps_shared_index() {
        let sources = strings(&["//div[1]/ul/li[1]/a", "//div[1]/ul/li[2]/a"]);
        let merged = smart_merge(&sources).expect("merge");
        assert_eq!(merged, "//div[1]/ul/li/a");
    }

    #[test]
    fn test_fold_keeps_two_thirds_majority_index() {
        let sources = strings(&[
            "/html/body[1]/div[2]/a[1]",
            "/html/body[1]/div[2]/a[1]",
            "/html/body[1]/div[3]/a[1]",
        ]);
        let merged = smart_merge(&sources).expect("merge");
        assert_eq!(merged, "/html/body[1]/div[2]/a[1]");
    }

    #[test]
    fn test_fold_rejects_tag_mismatch() {
        let sources = strings(&["//div/ul/li/a", "//div/ol/li/a"]);
        assert!(smart_merge(&sources).is_none());
    }

    #[test]
    fn test_class_rescue_replaces_dropped_index() {
        // Different @class attribute strings share the 'news-item' token, so
        // the intersection is empty and the rescue has to recover it
        let sources = strings(&[
            "/html/body[1]/div[@class='news-item featured'][2]/a[1]",
            "/html/body[1]/div[@class='news-item'][5]/a[2]",
        ]);
        let merged = smart_merge(&sources).expect("merge");
        assert!(merged.contains("contains(@class, 'news-item')"), "got {merged}");
        assert!(merged.ends_with("/a"), "got {merged}");
    }

    #[test]
    fn test_suffix_alignment_with_shared_anchor() {
        let sources = strings(&[
            "//*[@id='main']/div[1]/article[1]/h1[1]",
            "//*[@id='main']/div[2]/div[1]/article[1]/h1[1]",
        ]);
        let merged = suffix_aligned_merge(&sources).expect("merge");
        assert_eq!(merged, "//*[@id='main']//div[1]/article[1]/h1[1]");
    }

    #[test]
    fn test_suffix_alignment_without_anchor_needs_depth() {
        let sources = strings(&["/html/body[1]/article[1]/h1[1]", "/html/body[1]/div[1]/article[1]/h1[1]"]);
        let merged = suffix_aligned_merge(&sources).expect("merge");
        assert_eq!(merged, "//article[1]/h1[1]");
    }

    #[test]
    fn test_over_broad_rules() {
        assert!(is_over_broad("//div//span"));
        assert!(is_over_broad("//section//div"));
        assert!(is_over_broad("//*"));
        assert!(is_over_broad("span/a"));
        assert!(!is_over_broad("//*[@id='main']/div/a"));
        assert!(!is_over_broad("//div[contains(@class, 'list')]//a"));
        assert!(is_over_broad("//*[@id='x']/a | //div//span"));
    }

    #[test]
    fn test_dominant_exact_majority() {
        let sources = strings(&[
            "//*[@id='t']/td[2]",
            "//*[@id='t']/td[2]",
            "//table/tr[1]/td[2]",
        ]);
        assert_eq!(dominant_exact(&sources).as_deref(), Some("//*[@id='t']/td[2]"));
    }

    #[test]
    fn test_dominant_exact_below_half() {
        let sources = strings(&["//a[1]", "//b[1]", "//c[1]"]);
        assert!(dominant_exact(&sources).is_none());
    }

    #[test]
    fn test_union_requires_structural_difference() {
        assert!(union_pattern(&strings(&["//ul/li[1]/a", "//ul/li[2]/a"])).is_none());
        let union = union_pattern(&strings(&[
            "//*[@id='list']/li/a",
            "//*[@id='cards']/div/a",
        ]))
        .expect("union");
        assert_eq!(union, "//*[@id='list']/li/a | //*[@id='cards']/div/a");
    }

    #[test]
    fn test_confidence_blend() {
        let sources = strings(&["//*[@id='x']/a", "//*[@id='x']/a"]);
        // Exact matches on both: 0.7 + 0.3
        assert!((pattern_confidence(&sources, "//*[@id='x']/a") - 1.0).abs() < 1e-9);
        // Normalized-only match
        let sources = strings(&["//div/ul/li[1]/a", "//div/ul/li[2]/a"]);
        assert!((pattern_confidence(&sources, "//div/ul/li/a") - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_stability_scoring_order() {
        assert!(stability_score("//*[@id='main']/a") > stability_score("//div[3]/span[2]/a[1]"));
        assert!(stability_score("//div[@data-row='x']") > stability_score("//div[contains(@class, 'modal')]"));
    }

    #[test]
    fn test_stable_class_token_filters() {
        assert!(is_stable_class_token("news-item"));
        assert!(!is_stable_class_token("col"));
        assert!(!is_stable_class_token("active"));
        assert!(!is_stable_class_token("x1"));
        assert!(!is_stable_class_token("item-1234567"));
        assert!(!is_stable_class_token("a3f9c2d41b"));
    }

    #[tokio::test]
    async fn test_synthesize_prefers_stable_candidate_group() {
        use crate::som::snapshot::{XPathCandidate, XPathStrategy};

        let candidate = |xpath: &str, strategy, priority| XPathCandidate {
            xpath: xpath.into(),
            priority,
            strategy,
            confidence: 0.9,
        };
        let per_source = vec![
            vec![
                candidate("//*[@id='info']/span[1]", XPathStrategy::IdRelative, 3),
                candidate("/html/body[1]/div[4]/span[1]", XPathStrategy::Absolute, 7),
            ],
            vec![
                candidate("//*[@id='info']/span[1]", XPathStrategy::IdRelative, 3),
                candidate("/html/body[1]/div[6]/span[1]", XPathStrategy::Absolute, 7),
            ],
        ];
        let sources = strings(&["/html/body[1]/div[4]/span[1]", "/html/body[1]/div[6]/span[1]"]);

        let synthesizer = PatternSynthesizer::new();
        let result = synthesizer
            .synthesize("price", &sources, &per_source)
            .await
            .expect("pattern");
        assert_eq!(result.pattern, "//*[@id='info']/span[1]");
    }

    #[tokio::test]
    async fn test_synthesize_isomorphic_prefers_dominant() {
        let sources = strings(&[
            "//*[@id='d']/table/tr[2]/td[2]",
            "//*[@id='d']/table/tr[2]/td[2]",
            "//*[@id='d']/table/tr[3]/td[2]",
        ]);
        let synthesizer = PatternSynthesizer::new();
        let result = synthesizer
            .synthesize("date", &sources, &[])
            .await
            .expect("pattern");
        assert_eq!(result.pattern, "//*[@id='d']/table/tr[2]/td[2]");
    }
}
