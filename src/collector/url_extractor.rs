//! Detail-URL extraction ladder
//!
//! Three ways to learn where a detail link leads, cheapest first: read its
//! href, click and capture the tab it opens, or click, observe an in-page
//! navigation, and go back.

use std::collections::HashMap;

use log::debug;

use crate::actions::{Action, ActionExecutor};
use crate::browser::{xpath, PageHandle};
use crate::som::snapshot::ElementMark;
use crate::utils::resolve_href;

/// How the URL was obtained, recorded on each visit for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlSource {
    Href,
    NewTab,
    InPageNavigation,
}

/// Extract the detail URL behind one marked element.
///
/// The executor's active page may be swapped during the click path; it is
/// always restored (go_back_tab / go_back) before returning.
pub async fn extract_url_for_mark(
    executor: &mut ActionExecutor<'_>,
    mark: &ElementMark,
    mark_to_xpath: &HashMap<u64, Vec<String>>,
    base_url: &str,
    step_index: usize,
) -> Option<(String, UrlSource)> {
    // 1. href straight off the mark
    if let Some(href) = &mark.href {
        if let Some(url) = resolve_href(base_url, href) {
            return Some((url, UrlSource::Href));
        }
    }

    // The scanner can miss an href added after render; read the live DOM
    let som_selector = format!("[data-som-id=\"{}\"]", mark.mark_id);
    if let Ok(Some(href)) = xpath::attribute(executor.page().as_ref(), &som_selector, "href", 0).await
    {
        if let Some(url) = resolve_href(base_url, &href) {
            return Some((url, UrlSource::Href));
        }
    }

    // 2. click and see where we end up
    let before_url = executor.page().current_url().await.ok()?;
    let before_page_id = executor.page().id();

    let action = Action::Click {
        mark_id: mark.mark_id,
        target_text: (!mark.text.is_empty()).then(|| mark.text.clone()),
    };
    let (result, _) = executor.execute(&action, mark_to_xpath, step_index).await;
    if !result.success {
        debug!("click failed while extracting URL for mark {}: {:?}", mark.mark_id, result.error);
        return None;
    }

    let after_page_id = executor.page().id();
    let after_url = executor.page().current_url().await.ok()?;

    if after_page_id != before_page_id {
        // A tab opened; capture its URL and close it
        let (back, _) = executor.execute(&Action::GoBackTab, mark_to_xpath, step_index).await;
        if !back.success {
            debug!("go_back_tab failed after URL capture: {:?}", back.error);
        }
        return Some((after_url, UrlSource::NewTab));
    }

    if after_url != before_url {
        // In-page navigation; step back to the list
        let (back, _) = executor.execute(&Action::GoBack, mark_to_xpath, step_index).await;
        if !back.success {
            debug!("go_back failed after URL capture: {:?}", back.error);
        }
        return Some((after_url, UrlSource::InPageNavigation));
    }

    None
}
