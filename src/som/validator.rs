//! mark_id validation against the snapshot
//!
//! Vision models read text reliably but misattribute the integer id of the
//! element bearing it. The validator treats the claimed text as ground truth:
//! an id whose element carries that text is accepted, otherwise all marks
//! are scanned for the text and the id is corrected, flagged ambiguous, or
//! reported missing.

use serde::Serialize;

use crate::utils::text::{normalize_text, strip_whitespace, text_similarity};

use super::snapshot::{ElementMark, SoMSnapshot};

/// Outcome of validating one (mark_id, text) claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// The claimed id's element carries the claimed text
    IdMatch,
    /// The id was wrong but exactly one mark carries the text
    TextUnique,
    /// Several marks carry the text; caller must disambiguate
    TextAmbiguous,
    /// No mark carries the text; the claim is unusable
    TextNotFound,
}

/// One validation result
#[derive(Debug, Clone)]
pub struct MarkIdValidationResult {
    /// The id this claim resolved to (corrected where applicable)
    pub mark_id: Option<u64>,
    pub llm_text: String,
    pub actual_text: String,
    pub similarity: f64,
    pub status: MatchStatus,
    /// Candidates to redraw when ambiguous
    pub candidate_mark_ids: Vec<u64>,
}

impl MarkIdValidationResult {
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self.status, MatchStatus::IdMatch | MatchStatus::TextUnique)
    }
}

/// Text-first validator over one snapshot
pub struct MarkIdValidator;

impl Default for MarkIdValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkIdValidator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validate a claimed mark_id → text map against the snapshot
    pub fn validate_map(
        &self,
        mark_id_text_map: &std::collections::BTreeMap<String, String>,
        snapshot: &SoMSnapshot,
    ) -> Vec<MarkIdValidationResult> {
        mark_id_text_map
            .iter()
            .map(|(id_str, text)| self.validate_one(id_str, text, snapshot))
            .collect()
    }

    fn validate_one(
        &self,
        id_str: &str,
        llm_text: &str,
        snapshot: &SoMSnapshot,
    ) -> MarkIdValidationResult {
        let claimed_id: Option<u64> = id_str.trim().parse().ok();

        // Step 1: trust the id only when its element carries the claimed
        // text. The similarity score is diagnostic; it never gates the
        // decision.
        if let Some(mark) = claimed_id.and_then(|id| snapshot.mark(id)) {
            let actual = mark.effective_text();
            if texts_match(llm_text, actual) {
                return MarkIdValidationResult {
                    mark_id: Some(mark.mark_id),
                    llm_text: llm_text.to_string(),
                    actual_text: actual.to_string(),
                    similarity: text_similarity(llm_text, actual),
                    status: MatchStatus::IdMatch,
                    candidate_mark_ids: vec![mark.mark_id],
                };
            }
        }

        // Step 2: the text is the ground truth; scan every mark for it
        let hits: Vec<&ElementMark> = snapshot
            .marks
            .iter()
            .filter(|mark| texts_match(llm_text, mark.effective_text()))
            .collect();

        match hits.len() {
            0 => MarkIdValidationResult {
                mark_id: None,
                llm_text: llm_text.to_string(),
                actual_text: String::new(),
                similarity: 0.0,
                status: MatchStatus::TextNotFound,
                candidate_mark_ids: Vec::new(),
            },
            1 => {
                let mark = hits[0];
                MarkIdValidationResult {
                    mark_id: Some(mark.mark_id),
                    llm_text: llm_text.to_string(),
                    actual_text: mark.effective_text().to_string(),
                    similarity: text_similarity(llm_text, mark.effective_text()),
                    status: MatchStatus::TextUnique,
                    candidate_mark_ids: vec![mark.mark_id],
                }
            }
            _ => MarkIdValidationResult {
                mark_id: None,
                llm_text: llm_text.to_string(),
                actual_text: hits[0].effective_text().to_string(),
                similarity: text_similarity(llm_text, hits[0].effective_text()),
                status: MatchStatus::TextAmbiguous,
                candidate_mark_ids: hits.iter().map(|m| m.mark_id).collect(),
            },
        }
    }
}

/// Whether a claimed text matches an element text.
///
/// Short texts (≤2 codepoints after whitespace strip) require equality of
/// the whitespace-stripped normalized form; longer texts accept containment
/// in either direction. The claimed text is tried in several variants to
/// tolerate ellipsis and truncation at bracket characters.
#[must_use]
pub fn texts_match(claimed: &str, actual: &str) -> bool {
    let actual_norm = normalize_text(actual);
    let actual_stripped = strip_whitespace(actual);
    if actual_stripped.is_empty() {
        return false;
    }

    for variant in claimed_variants(claimed) {
        let claimed_norm = normalize_text(&variant);
        let claimed_stripped = strip_whitespace(&variant);
        if claimed_stripped.is_empty() {
            continue;
        }

        let short = claimed_stripped.chars().count() <= 2;
        if short {
            if claimed_stripped == actual_stripped {
                return true;
            }
            continue;
        }

        if actual_norm.contains(&claimed_norm) || claimed_norm.contains(&actual_norm) {
            return true;
        }
        if actual_stripped.contains(&claimed_stripped)
            || claimed_stripped.contains(&actual_stripped)
        {
            return true;
        }
    }
    false
}

/// Variants of the claimed text tolerant of model-side truncation
fn claimed_variants(claimed: &str) -> Vec<String> {
    let base = claimed.trim().to_string();
    let mut variants = vec![base.clone()];

    for suffix in ["…", "..."] {
        if let Some(stripped) = base.strip_suffix(suffix) {
            let stripped = stripped.trim().to_string();
            if !stripped.is_empty() {
                variants.push(stripped);
            }
        }
    }

    // Models often stop reading at an opening bracket
    const BRACKETS: [char; 6] = ['(', '（', '[', '【', '<', '《'];
    if let Some(pos) = base.find(|c| BRACKETS.contains(&c)) {
        let prefix = base[..pos].trim().to_string();
        if !prefix.is_empty() {
            variants.push(prefix);
        }
    }

    variants.dedup();
    variants
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::som::snapshot::{BoundingBox, SoMSnapshot};

    fn mark(id: u64, text: &str) -> ElementMark {
        ElementMark {
            mark_id: id,
            tag: "a".into(),
            role: None,
            text: text.into(),
            aria_label: None,
            placeholder: None,
            title: None,
            value: None,
            href: Some(format!("/detail/{id}")),
            input_type: None,
            bbox: BoundingBox::default(),
            center_normalized: (0.5, 0.5),
            xpath_candidates: vec![],
            is_visible: true,
        }
    }

    fn snapshot(marks: Vec<ElementMark>) -> SoMSnapshot {
        SoMSnapshot {
            url: "https://example.com".into(),
            title: String::new(),
            viewport_width: 1280,
            viewport_height: 720,
            marks,
            scroll_info: None,
            timestamp: 0,
        }
    }

    fn map(entries: &[(&str, &str)]) -> std::collections::BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_id_match_accepted() {
        let snap = snapshot(vec![mark(5, "查看详情")]);
        let results = MarkIdValidator::new().validate_map(&map(&[("5", "查看详情")]), &snap);
        assert_eq!(results[0].status, MatchStatus::IdMatch);
        assert_eq!(results[0].mark_id, Some(5));
    }

    #[test]
    fn test_wrong_id_corrected_by_unique_text() {
        let snap = snapshot(vec![mark(1, "previous"), mark(2, "Tender notice 42")]);
        let results =
            MarkIdValidator::new().validate_map(&map(&[("9", "Tender notice 42")]), &snap);
        assert_eq!(results[0].status, MatchStatus::TextUnique);
        assert_eq!(results[0].mark_id, Some(2));
    }

    #[test]
    fn test_duplicate_text_is_ambiguous() {
        let snap = snapshot(vec![mark(12, "查看详情"), mark(17, "查看详情")]);
        let results = MarkIdValidator::new().validate_map(&map(&[("3", "查看详情")]), &snap);
        assert_eq!(results[0].status, MatchStatus::TextAmbiguous);
        assert_eq!(results[0].candidate_mark_ids, vec![12, 17]);
    }

    #[test]
    fn test_high_similarity_without_containment_is_not_id_match() {
        // One digit apart scores high on edit distance but the texts do not
        // contain each other, so the claimed id must not be trusted
        let snap = snapshot(vec![mark(4, "Tender notice 2025")]);
        let results =
            MarkIdValidator::new().validate_map(&map(&[("4", "Tender notice 2026")]), &snap);
        assert_eq!(results[0].status, MatchStatus::TextNotFound);
        assert!(results[0].similarity < 1.0);
    }

    #[test]
    fn test_missing_text_not_found() {
        let snap = snapshot(vec![mark(1, "home")]);
        let results = MarkIdValidator::new().validate_map(&map(&[("1", "does not exist")]), &snap);
        assert_eq!(results[0].status, MatchStatus::TextNotFound);
    }

    #[test]
    fn test_short_text_requires_equality() {
        // "下页" must not containment-match "下一页设置"
        assert!(!texts_match("下", "下一页"));
        assert!(texts_match("下 一 页", "下一页"));
    }

    #[test]
    fn test_long_text_containment_both_ways() {
        assert!(texts_match("Tender notice", "Tender notice for road works"));
        assert!(texts_match("Tender notice for road works", "Tender notice"));
    }

    #[test]
    fn test_ellipsis_variant() {
        assert!(texts_match("Annual procurement…", "Annual procurement plan 2026"));
        assert!(texts_match("Annual procurement...", "Annual procurement plan 2026"));
    }

    #[test]
    fn test_bracket_truncation_variant() {
        assert!(texts_match("城市道路工程（第一标段）", "城市道路工程"));
    }
}
