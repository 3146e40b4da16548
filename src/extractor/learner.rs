//! Per-field learning loop
//!
//! The fallback and bootstrap path: when no template exists for a field (or
//! the template missed on a required field), drive the model to the value on
//! this one page, then work backwards from the value text to a stable xpath
//! and verify it before trusting it.

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, info, warn};

use crate::actions::{Action, ActionExecutor};
use crate::browser::{xpath, PageHandle};
use crate::config::SpiderConfig;
use crate::llm::decisions::{parse_selected_index, FieldNavDecision, ValueVerdict};
use crate::llm::{chat_for_message, LlmClient};
use crate::pattern::is_type_valid;
use crate::som::{
    build_mark_id_to_xpath_map, capture_screenshot_base64, capture_screenshot_with_custom_marks,
    format_marks_for_llm, inject_and_scan, resolve_single_mark_id, CustomMark,
};
use crate::task::{DataType, FieldDefinition};
use crate::utils::normalize_text;

use super::fuzzy::{find_text_matches, is_interactive_only_tag, rank_candidates, TextMatch};
use super::record::FieldOutcome;

/// Nodes read when checking a learned xpath's uniqueness
const VERIFY_NODE_LIMIT: usize = 6;

const FIELD_NAV_SYSTEM_PROMPT: &str = "\
You locate one field's value on a detail page. Interactive elements carry \
numbered marks. Reply with JSON only, one of: {\"action\": \"extract\", \
\"args\": {\"field_value\": \"<the value you read>\", \"target_text\": \
\"<exact on-page text bearing it>\", \"confidence\": 0.0-1.0}} when the \
value is visible; {\"action\": \"click\", \"args\": {\"mark_id\": N, \
\"target_text\": \"...\"}} to open a tab or section hiding it; {\"action\": \
\"scroll\", \"args\": {}} to look further down.";

const FIELD_SELECT_SYSTEM_PROMPT: &str = "\
You pick which outlined element carries a field's value. Elements are \
renumbered starting at 1. Reply with JSON only: {\"action\": \"select\", \
\"args\": {\"selected_mark_id\": <number>}}";

/// Learn one field on the current page. Never errors; failures come back as
/// an outcome with an error string.
pub async fn learn_field_on_page(
    executor: &mut ActionExecutor<'_>,
    llm: &dyn LlmClient,
    field: &FieldDefinition,
    config: &SpiderConfig,
) -> FieldOutcome {
    let Some((value, target_text, confidence)) =
        navigate_to_field(executor, llm, field, config).await
    else {
        return FieldOutcome::missing(&field.name, "field not reached within step budget");
    };

    let page = executor.page();
    let search_text = if target_text.trim().is_empty() {
        value.clone()
    } else {
        target_text
    };

    let matches = match find_text_matches(
        page.as_ref(),
        &search_text,
        field.data_type,
        config.extractor.fuzzy_match_threshold,
    )
    .await
    {
        Ok(matches) => matches,
        Err(e) => return FieldOutcome::missing(&field.name, format!("text search failed: {e}")),
    };
    if matches.is_empty() {
        return FieldOutcome::missing(
            &field.name,
            format!("no DOM node matched '{}'", truncate(&search_text, 60)),
        );
    }

    let chosen = if matches.len() == 1 {
        matches.into_iter().next()
    } else {
        disambiguate_matches(page.as_ref(), llm, &field.name, matches).await
    };
    let Some(chosen) = chosen else {
        return FieldOutcome::missing(&field.name, "ambiguous matches, reselect failed");
    };

    let candidates = rank_candidates(chosen.xpath_candidates.clone());
    let mut verified_xpath = None;
    let mut verified_value = None;
    for candidate in &candidates {
        if let Some(read) =
            verify_xpath(page.as_ref(), &candidate.xpath, field, &chosen.tag).await
        {
            verified_xpath = Some(candidate.xpath.clone());
            verified_value = Some(read);
            break;
        }
    }
    let (Some(xpath_used), Some(read_value)) = (verified_xpath, verified_value) else {
        return FieldOutcome::missing(&field.name, "no candidate xpath survived verification");
    };

    // Semantic confirmation against the field description
    let final_value = match validate_semantically(llm, field, &read_value).await {
        Some(normalized) => normalized,
        None => {
            return FieldOutcome::missing(&field.name, "semantic validation rejected the value")
        }
    };

    info!(
        "learned '{}' = '{}' via {}",
        field.name,
        truncate(&final_value, 60),
        xpath_used
    );
    FieldOutcome {
        field_name: field.name.clone(),
        value: Some(final_value),
        confidence,
        error: None,
        xpath: Some(xpath_used),
        xpath_candidates: candidates,
    }
}

/// Drive the model until it reads the value, clicking through tabs and
/// sections on the way. The same navigation element is never clicked twice.
async fn navigate_to_field(
    executor: &mut ActionExecutor<'_>,
    llm: &dyn LlmClient,
    field: &FieldDefinition,
    config: &SpiderConfig,
) -> Option<(String, String, f64)> {
    let mut clicked: HashSet<u64> = HashSet::new();

    for step in 0..config.extractor.max_nav_steps {
        let page = executor.page();
        let snapshot = inject_and_scan(page.as_ref()).await.ok()?;
        let (_, screenshot) = capture_screenshot_base64(page.as_ref()).await.ok()?;

        // Give the model the page text so it can quote the bearing line
        let page_text = page.inner_text().await.unwrap_or_default();
        let excerpt: String = page_text.chars().take(3_000).collect();

        let example = field
            .example
            .as_deref()
            .map(|e| format!("\nExample value: {e}"))
            .unwrap_or_default();
        let user = format!(
            "Field: {}\nDescription: {}\nType: {:?}{example}\nPage text (excerpt):\n{excerpt}\n\nMarked elements:\n{}",
            field.name,
            field.description,
            field.data_type,
            format_marks_for_llm(&snapshot, 50)
        );

        let decision = match chat_for_message(llm, FIELD_NAV_SYSTEM_PROMPT, &user, &[screenshot])
            .await
            .and_then(|message| FieldNavDecision::from_message(&message))
        {
            Ok(decision) => decision,
            Err(e) => {
                debug!("field nav decision failed at step {step}: {e}");
                continue;
            }
        };

        match decision {
            FieldNavDecision::Extract {
                field_value,
                target_text,
                confidence,
            } => return Some((field_value, target_text, confidence)),
            FieldNavDecision::Click { mark_id, target_text } => {
                let resolved = match resolve_single_mark_id(
                    page.as_ref(),
                    llm,
                    &snapshot,
                    mark_id,
                    &target_text,
                    config.collector.max_validation_retries,
                )
                .await
                {
                    Ok(id) => id,
                    Err(e) => {
                        debug!("field nav click unresolved: {e}");
                        continue;
                    }
                };
                if !clicked.insert(resolved) {
                    debug!("mark {resolved} already clicked, skipping");
                    continue;
                }
                let mark_map = build_mark_id_to_xpath_map(&snapshot);
                let action = Action::Click {
                    mark_id: resolved,
                    target_text: (!target_text.is_empty()).then_some(target_text),
                };
                let (result, _) = executor.execute(&action, &mark_map, step).await;
                if !result.success {
                    debug!("field nav click failed: {:?}", result.error);
                }
            }
            FieldNavDecision::Type { mark_id, text } => {
                let Some(mark_id) = mark_id else { continue };
                let mark_map = build_mark_id_to_xpath_map(&snapshot);
                let action = Action::Type {
                    mark_id,
                    text,
                    target_text: None,
                    expectation: None,
                    key: None,
                };
                let _ = executor.execute(&action, &mark_map, step).await;
            }
            FieldNavDecision::Scroll => {
                let _ = executor.page().scroll_by(0.0, 400.0).await;
                tokio::time::sleep(Duration::from_secs_f64(config.collector.scroll_delay)).await;
            }
        }
    }
    None
}

/// Overlay the matching nodes, renumbered, and let the model pick one
async fn disambiguate_matches(
    page: &dyn crate::browser::PageHandle,
    llm: &dyn LlmClient,
    field_name: &str,
    matches: Vec<TextMatch>,
) -> Option<TextMatch> {
    let shown: Vec<TextMatch> = matches.into_iter().take(20).collect();
    let overlays: Vec<CustomMark> = shown
        .iter()
        .enumerate()
        .map(|(i, m)| CustomMark {
            label: (i + 1).to_string(),
            bbox: m.bbox,
        })
        .collect();

    let (_, screenshot) = capture_screenshot_with_custom_marks(page, &overlays).await.ok()?;
    let user = format!(
        "{} elements are outlined, numbered 1..{}. Which one carries the value \
         of field '{field_name}'?",
        shown.len(),
        shown.len()
    );
    let message = chat_for_message(llm, FIELD_SELECT_SYSTEM_PROMPT, &user, &[screenshot])
        .await
        .ok()?;
    let index = parse_selected_index(&message, shown.len())?;
    shown.into_iter().nth(index - 1)
}

/// Accept a candidate xpath only when it is unique, type-valid, lands on
/// content (not chrome), and reads the same value twice
async fn verify_xpath(
    page: &dyn crate::browser::PageHandle,
    candidate: &str,
    field: &FieldDefinition,
    matched_tag: &str,
) -> Option<String> {
    let prefer_url = field.data_type == DataType::Url;
    let matched = xpath::count(page, candidate).await.ok()?;
    if matched == 0 {
        return None;
    }

    let mut values = Vec::new();
    for nth in 0..matched.min(VERIFY_NODE_LIMIT) {
        if let Ok(Some(value)) = xpath::read_value(page, candidate, nth, prefer_url).await {
            values.push(value);
        }
    }
    let distinct: HashSet<String> = values.iter().map(|v| normalize_text(v)).collect();
    if values.is_empty() || distinct.len() > 1 {
        debug!("candidate {candidate} not unique ({} distinct values)", distinct.len());
        return None;
    }
    let first_read = values.remove(0);

    if !is_type_valid(&first_read, field.data_type) {
        debug!("candidate {candidate} value failed type check");
        return None;
    }
    if field.data_type != DataType::Url && is_interactive_only_tag(matched_tag) {
        debug!("candidate {candidate} sits on interactive chrome ({matched_tag})");
        return None;
    }

    // Stability: the same read a moment later
    tokio::time::sleep(Duration::from_millis(300)).await;
    let second_read = xpath::read_value(page, candidate, 0, prefer_url)
        .await
        .ok()
        .flatten()?;
    if normalize_text(&second_read) != normalize_text(&first_read) {
        debug!("candidate {candidate} read unstable");
        return None;
    }

    Some(first_read)
}

async fn validate_semantically(
    llm: &dyn LlmClient,
    field: &FieldDefinition,
    value: &str,
) -> Option<String> {
    let system = "You judge whether an extracted value semantically fits a \
        field description. Reply with JSON only: {\"action\": \"validate\", \
        \"args\": {\"is_valid\": true|false, \"normalized_value\": \"...\", \
        \"reason\": \"...\"}}";
    let user = format!(
        "Field: {}\nDescription: {}\nType: {:?}\nExtracted value: {value}",
        field.name, field.description, field.data_type
    );
    match chat_for_message(llm, system, &user, &[]).await {
        Ok(message) => {
            let verdict = ValueVerdict::from_message(&message, value);
            if verdict.is_valid {
                Some(verdict.normalized_value)
            } else {
                warn!(
                    "semantic validation rejected '{}': {}",
                    field.name,
                    if verdict.reason.is_empty() { "no reason" } else { &verdict.reason }
                );
                None
            }
        }
        Err(e) => {
            warn!("semantic validation unavailable: {e}");
            None
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
