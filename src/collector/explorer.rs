//! Exploration phase
//!
//! Visit a handful of detail pages under vision guidance and record how each
//! was reached. The clicked elements' xpath candidates are the raw material
//! the detail-link template is induced from, so distinct visits matter more
//! than many visits.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::actions::ActionExecutor;
use crate::browser::PageHandle;
use crate::config::CollectorConfig;
use crate::llm::decisions::ExploreDecision;
use crate::llm::{chat_for_message, LlmClient};
use crate::pattern::fold_detail_xpath;
use crate::som::snapshot::XPathCandidate;
use crate::som::{
    build_mark_id_to_xpath_map, capture_screenshot_base64, format_marks_for_llm, inject_and_scan,
    resolve_mark_ids_from_map,
};
use crate::utils::sleep_jittered;

use super::url_extractor::extract_url_for_mark;

/// The loop stops after this many consecutive scrolls that ended at the
/// page bottom; the list is exhausted
const MAX_BOTTOM_HITS: usize = 3;

const EXPLORE_SYSTEM_PROMPT: &str = "\
You are exploring a list page to find links that open detail pages for the \
given task. Interactive elements carry numbered marks. Reply with JSON only, \
one of: {\"action\": \"select\", \"args\": {\"purpose\": \"detail_links\", \
\"mark_id_text_map\": {\"<mark_id>\": \"<visible text>\", ...}}} to name \
candidate detail links; {\"action\": \"click\", \"args\": {\"mark_id\": N, \
\"target_text\": \"...\"}} to open one entry; {\"action\": \"scroll\", \
\"args\": {}} to reveal more entries; {\"action\": \"report\", \"args\": \
{\"page_kind\": \"detail\"}} if the current page already is a detail page.";

/// One observed visit to a detail page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailVisit {
    pub list_page_url: String,
    pub detail_page_url: String,
    /// Visible text of the element that led there
    pub clicked_text: String,
    /// Multi-strategy candidates of the clicked element
    pub clicked_xpath_candidates: Vec<XPathCandidate>,
    pub step_index: usize,
    pub visited_at: String,
}

/// Explore until `explore_count` distinct detail pages have been visited
pub async fn explore_detail_pages(
    executor: &mut ActionExecutor<'_>,
    llm: &dyn LlmClient,
    task_description: &str,
    config: &CollectorConfig,
) -> Vec<DetailVisit> {
    let mut visits: Vec<DetailVisit> = Vec::new();
    let mut bottom_hits = 0usize;
    let max_iterations = config.explore_count * 6 + 4;

    for iteration in 0..max_iterations {
        if visits.len() >= config.explore_count {
            break;
        }
        sleep_jittered(config.action_delay_base, config.action_delay_random).await;

        let page = executor.page();
        let snapshot = match inject_and_scan(page.as_ref()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("explore snapshot failed: {e}");
                break;
            }
        };
        let screenshot = match capture_screenshot_base64(page.as_ref()).await {
            Ok((_, encoded)) => encoded,
            Err(e) => {
                warn!("explore screenshot failed: {e}");
                break;
            }
        };

        let user = format!(
            "Task: {task_description}\nVisited so far: {}/{}\nCurrent URL: {}\nMarked elements:\n{}",
            visits.len(),
            config.explore_count,
            snapshot.url,
            format_marks_for_llm(&snapshot, 60)
        );
        let decision = match chat_for_message(llm, EXPLORE_SYSTEM_PROMPT, &user, &[screenshot])
            .await
            .and_then(|message| ExploreDecision::from_message(&message))
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!("explore decision failed at iteration {iteration}: {e}");
                continue;
            }
        };

        match decision {
            ExploreDecision::ReportDetailPage => {
                // We are standing on a detail page; record it and go back
                let detail_url = page.current_url().await.unwrap_or_default();
                if !detail_url.is_empty()
                    && !visits.iter().any(|v| v.detail_page_url == detail_url)
                {
                    visits.push(DetailVisit {
                        list_page_url: String::new(),
                        detail_page_url: detail_url,
                        clicked_text: String::new(),
                        clicked_xpath_candidates: Vec::new(),
                        step_index: iteration,
                        visited_at: chrono::Utc::now().to_rfc3339(),
                    });
                }
                let mark_map = build_mark_id_to_xpath_map(&snapshot);
                let (_, _) = executor
                    .execute(&crate::actions::Action::GoBack, &mark_map, iteration)
                    .await;
            }
            ExploreDecision::SelectDetailLinks { mark_id_text_map } => {
                let resolved = match resolve_mark_ids_from_map(
                    page.as_ref(),
                    llm,
                    &snapshot,
                    &mark_id_text_map,
                    config.max_validation_retries,
                )
                .await
                {
                    Ok(ids) => ids,
                    Err(e) => {
                        warn!("detail-link selection unresolved: {e}");
                        continue;
                    }
                };

                let mark_map = build_mark_id_to_xpath_map(&snapshot);
                let list_url = snapshot.url.clone();
                for mark_id in resolved {
                    if visits.len() >= config.explore_count {
                        break;
                    }
                    let Some(mark) = snapshot.mark(mark_id).cloned() else {
                        continue;
                    };
                    match extract_url_for_mark(executor, &mark, &mark_map, &list_url, iteration)
                        .await
                    {
                        Some((url, source)) => {
                            if visits.iter().any(|v| v.detail_page_url == url) {
                                continue;
                            }
                            info!("detail visit #{} via {source:?}: {url}", visits.len() + 1);
                            visits.push(DetailVisit {
                                list_page_url: list_url.clone(),
                                detail_page_url: url,
                                clicked_text: mark.text.clone(),
                                clicked_xpath_candidates: mark.xpath_candidates.clone(),
                                step_index: iteration,
                                visited_at: chrono::Utc::now().to_rfc3339(),
                            });
                        }
                        None => warn!("no URL behind mark {mark_id}"),
                    }
                }
            }
            ExploreDecision::Click { mark_id, target_text } => {
                let resolved = match crate::som::resolve_single_mark_id(
                    page.as_ref(),
                    llm,
                    &snapshot,
                    mark_id,
                    &target_text,
                    config.max_validation_retries,
                )
                .await
                {
                    Ok(id) => id,
                    Err(e) => {
                        warn!("explore click target unresolved: {e}");
                        continue;
                    }
                };
                let Some(mark) = snapshot.mark(resolved).cloned() else {
                    continue;
                };
                let mark_map = build_mark_id_to_xpath_map(&snapshot);
                let list_url = snapshot.url.clone();
                if let Some((url, source)) =
                    extract_url_for_mark(executor, &mark, &mark_map, &list_url, iteration).await
                {
                    if !visits.iter().any(|v| v.detail_page_url == url) {
                        info!("detail visit #{} via {source:?}: {url}", visits.len() + 1);
                        visits.push(DetailVisit {
                            list_page_url: list_url,
                            detail_page_url: url,
                            clicked_text: mark.text.clone(),
                            clicked_xpath_candidates: mark.xpath_candidates.clone(),
                            step_index: iteration,
                            visited_at: chrono::Utc::now().to_rfc3339(),
                        });
                    }
                }
            }
            ExploreDecision::Scroll => {
                let at_bottom = snapshot.at_bottom();
                if at_bottom {
                    bottom_hits += 1;
                    if bottom_hits >= MAX_BOTTOM_HITS {
                        info!("page bottom reached {bottom_hits} times, list exhausted");
                        break;
                    }
                } else {
                    bottom_hits = 0;
                }
                let _ = executor.page().scroll_by(0.0, 400.0).await;
                tokio::time::sleep(std::time::Duration::from_secs_f64(config.scroll_delay)).await;
            }
        }
    }

    info!("exploration finished with {} visit(s)", visits.len());
    visits
}

/// Induce the shared detail-link xpath from the recorded visits. Each visit
/// contributes its most stable candidate.
#[must_use]
pub fn extract_common_detail_xpath(visits: &[DetailVisit]) -> Option<(String, f64)> {
    let mut xpaths = Vec::new();
    for visit in visits {
        let mut candidates = visit.clicked_xpath_candidates.clone();
        candidates.sort_by_key(|c| c.priority);
        if let Some(best) = candidates.first() {
            xpaths.push(best.xpath.clone());
        }
    }
    if xpaths.len() < 2 {
        return None;
    }
    fold_detail_xpath(&xpaths).map(|folded| (folded.pattern, folded.confidence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::som::snapshot::XPathStrategy;

    fn visit(xpath: &str) -> DetailVisit {
        DetailVisit {
            list_page_url: "https://example.com/list".into(),
            detail_page_url: format!("https://example.com/detail/{}", xpath.len()),
            clicked_text: "entry".into(),
            clicked_xpath_candidates: vec![XPathCandidate {
                xpath: xpath.into(),
                priority: 3,
                strategy: XPathStrategy::IdRelative,
                confidence: 0.85,
            }],
            step_index: 0,
            visited_at: String::new(),
        }
    }

    #[test]
    fn test_common_detail_xpath_from_visits() {
        let visits = vec![
            visit("//section//ul/li[1]/a"),
            visit("//section//ul/li[3]/a"),
            visit("//section//ul/li[5]/a"),
        ];
        let (pattern, confidence) = extract_common_detail_xpath(&visits).expect("pattern");
        assert_eq!(pattern, "//section//ul/li/a");
        assert!(confidence >= 0.9);
    }

    #[test]
    fn test_single_visit_insufficient() {
        assert!(extract_common_detail_xpath(&[visit("//ul/li[1]/a")]).is_none());
    }
}
