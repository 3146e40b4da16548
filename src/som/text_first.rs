//! Text-first mark_id resolution
//!
//! The project-wide policy for consuming LLM-claimed mark ids: correct the
//! id from the text, reselect on ambiguity with a renumbered overlay, and
//! fail loudly when the text is nowhere on the page. Batch maps tolerate
//! individual misses; single-item resolution does not.

use std::collections::BTreeMap;

use log::warn;

use crate::browser::PageHandle;
use crate::error::{SpiderError, SpiderResult};
use crate::llm::decisions::parse_selected_index;
use crate::llm::{chat_for_message, LlmClient};

use super::inject::{capture_screenshot_with_custom_marks, CustomMark};
use super::snapshot::{ElementMark, SoMSnapshot};
use super::validator::{MarkIdValidator, MatchStatus};

const DISAMBIGUATE_SYSTEM_PROMPT: &str = "\
You are selecting one element on a web page screenshot. Several candidate \
elements share the same visible text and have been outlined with red boxes, \
renumbered starting at 1. Reply with JSON only: \
{\"action\": \"select\", \"args\": {\"selected_mark_id\": <number>}}";

/// Resolve an LLM-claimed mark_id → text map into final mark ids.
///
/// Ambiguous entries go through up to `max_retries` overlay reselections.
/// When the map has more than one entry, unresolvable entries are dropped;
/// a single-entry map fails instead. An empty final set is always an error.
pub async fn resolve_mark_ids_from_map(
    page: &dyn PageHandle,
    llm: &dyn LlmClient,
    snapshot: &SoMSnapshot,
    mark_id_text_map: &BTreeMap<String, String>,
    max_retries: usize,
) -> SpiderResult<Vec<u64>> {
    let validator = MarkIdValidator::new();
    let results = validator.validate_map(mark_id_text_map, snapshot);

    let allow_partial = mark_id_text_map.len() > 1;
    let retries = max_retries.max(1);
    let mut final_ids = Vec::new();

    for result in results {
        match result.status {
            MatchStatus::IdMatch | MatchStatus::TextUnique => {
                if let Some(id) = result.mark_id {
                    final_ids.push(id);
                }
            }
            MatchStatus::TextAmbiguous => {
                let candidates: Vec<&ElementMark> = snapshot
                    .marks
                    .iter()
                    .filter(|m| result.candidate_mark_ids.contains(&m.mark_id))
                    .collect();
                match disambiguate_by_text(page, llm, &candidates, &result.llm_text, retries).await
                {
                    Ok(Some(selected)) => final_ids.push(selected),
                    Ok(None) if allow_partial => {
                        warn!(
                            "ambiguous text reselect failed, skipping entry: '{}'",
                            truncated(&result.llm_text)
                        );
                    }
                    Ok(None) => {
                        return Err(SpiderError::Llm(format!(
                            "ambiguous text reselect failed for '{}' (candidates {:?})",
                            result.llm_text, result.candidate_mark_ids
                        )));
                    }
                    Err(e) if allow_partial => {
                        warn!(
                            "ambiguous text reselect errored, skipping entry '{}': {e}",
                            truncated(&result.llm_text)
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            MatchStatus::TextNotFound => {
                if allow_partial {
                    warn!("text not found, skipping entry: '{}'", truncated(&result.llm_text));
                } else {
                    return Err(SpiderError::Llm(format!(
                        "target text not found among marks: '{}'",
                        result.llm_text
                    )));
                }
            }
        }
    }

    // Dedup preserving order
    let mut seen = std::collections::HashSet::new();
    final_ids.retain(|id| seen.insert(*id));

    if final_ids.is_empty() {
        return Err(SpiderError::Llm(
            "no mark_id could be resolved from the claimed texts".into(),
        ));
    }
    Ok(final_ids)
}

/// Resolve one (mark_id, target_text) claim; failure is fatal to the action
pub async fn resolve_single_mark_id(
    page: &dyn PageHandle,
    llm: &dyn LlmClient,
    snapshot: &SoMSnapshot,
    mark_id: Option<u64>,
    target_text: &str,
    max_retries: usize,
) -> SpiderResult<u64> {
    // With no text to check against, the claimed id is all there is
    if target_text.trim().is_empty() {
        return mark_id
            .filter(|id| snapshot.mark(*id).is_some())
            .ok_or_else(|| SpiderError::Llm("claim has neither text nor a known mark_id".into()));
    }

    let key = mark_id.map_or_else(|| "-1".to_string(), |id| id.to_string());
    let mut map = BTreeMap::new();
    map.insert(key, target_text.to_string());
    let resolved = resolve_mark_ids_from_map(page, llm, snapshot, &map, max_retries).await?;
    resolved.first().copied().ok_or_else(|| {
        SpiderError::Llm(format!("could not resolve element for text '{target_text}'"))
    })
}

/// Ask the LLM to pick among same-text candidates via a renumbered overlay.
///
/// Candidates beyond 20 are dropped to keep the render readable.
pub async fn disambiguate_by_text(
    page: &dyn PageHandle,
    llm: &dyn LlmClient,
    candidates: &[&ElementMark],
    target_text: &str,
    max_retries: usize,
) -> SpiderResult<Option<u64>> {
    if candidates.is_empty() {
        return Ok(None);
    }
    let shown = &candidates[..candidates.len().min(20)];

    let overlays: Vec<CustomMark> = shown
        .iter()
        .enumerate()
        .map(|(i, mark)| CustomMark {
            label: (i + 1).to_string(),
            bbox: mark.bbox,
        })
        .collect();

    let user_prompt = format!(
        "The text \"{target_text}\" matches {} outlined elements, renumbered \
         1..{}. Pick the one a person collecting list entries would click. \
         Answer with the new number.",
        shown.len(),
        shown.len()
    );

    for _ in 0..max_retries.max(1) {
        let (_, screenshot) = capture_screenshot_with_custom_marks(page, &overlays).await?;

        let message = match chat_for_message(
            llm,
            DISAMBIGUATE_SYSTEM_PROMPT,
            &user_prompt,
            &[screenshot],
        )
        .await
        {
            Ok(message) => message,
            Err(e) => {
                warn!("disambiguation ask failed: {e}");
                continue;
            }
        };

        if let Some(index) = parse_selected_index(&message, shown.len()) {
            return Ok(Some(shown[index - 1].mark_id));
        }
    }
    Ok(None)
}

fn truncated(text: &str) -> String {
    text.chars().take(60).collect()
}
