//! Action execution against a live page
//!
//! Element resolution uses Priority Fallback: each xpath candidate is tried
//! in order and accepted only on a unique, visible match, with the injected
//! `data-som-id` attribute as the last resort. Clicks race a new-tab watch;
//! when a tab opens, the executor adopts it as the active page so subsequent
//! actions land where the user ended up.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};

use crate::browser::{wait_for_new_page, xpath, BrowserHandle, PageHandle, SharedPage};
use crate::error::SpiderError;

use super::{Action, ActionResult, NavStep};

/// How long the new-tab race waits after a click
const NEW_TAB_TIMEOUT: Duration = Duration::from_secs(3);

/// Executes [`Action`]s, tracking the active page across tab switches
pub struct ActionExecutor<'a> {
    browser: &'a dyn BrowserHandle,
    page: SharedPage,
    previous_page: Option<SharedPage>,
    step_timeout: Duration,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(browser: &'a dyn BrowserHandle, page: SharedPage, step_timeout: Duration) -> Self {
        Self {
            browser,
            page,
            previous_page: None,
            step_timeout,
        }
    }

    /// The currently active page (may change after click / go_back_tab)
    #[must_use]
    pub fn page(&self) -> SharedPage {
        SharedPage::clone(&self.page)
    }

    /// Execute one action. Timeouts and unknown shapes come back as failed
    /// results, never as panics or errors.
    pub async fn execute(
        &mut self,
        action: &Action,
        mark_to_xpath: &HashMap<u64, Vec<String>>,
        step_index: usize,
    ) -> (ActionResult, Option<NavStep>) {
        let outcome = tokio::time::timeout(
            self.step_timeout,
            self.dispatch(action, mark_to_xpath, step_index),
        )
        .await;
        match outcome {
            Ok(result) => result,
            Err(_) => (
                ActionResult::failed(
                    SpiderError::timeout(action.kind(), self.step_timeout.as_secs()).to_string(),
                ),
                None,
            ),
        }
    }

    async fn dispatch(
        &mut self,
        action: &Action,
        mark_to_xpath: &HashMap<u64, Vec<String>>,
        step_index: usize,
    ) -> (ActionResult, Option<NavStep>) {
        match action {
            Action::Click { mark_id, target_text } => {
                self.do_click(*mark_id, target_text.as_deref(), mark_to_xpath, step_index)
                    .await
            }
            Action::Type {
                mark_id,
                text,
                target_text,
                expectation,
                key,
            } => {
                self.do_type(
                    *mark_id,
                    text,
                    target_text.as_deref(),
                    expectation.as_deref(),
                    key.as_deref(),
                    mark_to_xpath,
                    step_index,
                )
                .await
            }
            Action::Press { mark_id, key } => {
                self.do_press(*mark_id, key, mark_to_xpath, step_index).await
            }
            Action::Scroll { delta } => self.do_scroll(*delta, step_index).await,
            Action::Navigate { url } => self.do_navigate(url, step_index).await,
            Action::Wait { timeout_ms } => {
                tokio::time::sleep(Duration::from_millis(timeout_ms.unwrap_or(2_000))).await;
                (ActionResult::ok(), None)
            }
            Action::Extract { mark_id, target_text } => {
                self.do_extract(*mark_id, target_text.as_deref(), mark_to_xpath, step_index)
                    .await
            }
            Action::GoBack => self.do_go_back().await,
            Action::GoBackTab => self.do_go_back_tab().await,
            Action::Done | Action::Retry => (ActionResult::ok(), None),
        }
    }

    /// Priority Fallback: first candidate with a unique, visible match
    async fn find_by_xpath_list(&self, xpaths: &[String]) -> Option<String> {
        for candidate in xpaths {
            match xpath::unique_visible(self.page.as_ref(), candidate).await {
                Ok(true) => return Some(candidate.clone()),
                Ok(false) => continue,
                Err(e) => {
                    debug!("candidate probe failed for {candidate}: {e}");
                    continue;
                }
            }
        }
        None
    }

    /// Resolve a mark to a usable selector, falling back to data-som-id
    async fn resolve_mark(
        &self,
        mark_id: u64,
        mark_to_xpath: &HashMap<u64, Vec<String>>,
    ) -> Result<(String, Vec<String>), String> {
        let xpaths = mark_to_xpath.get(&mark_id).cloned().unwrap_or_default();
        if let Some(found) = self.find_by_xpath_list(&xpaths).await {
            return Ok((found, xpaths));
        }
        let fallback = format!("[data-som-id=\"{mark_id}\"]");
        match xpath::count(self.page.as_ref(), &fallback).await {
            Ok(n) if n > 0 => Ok((fallback, xpaths)),
            _ => Err(format!("cannot locate element (mark_id: {mark_id})")),
        }
    }

    async fn do_click(
        &mut self,
        mark_id: u64,
        target_text: Option<&str>,
        mark_to_xpath: &HashMap<u64, Vec<String>>,
        step_index: usize,
    ) -> (ActionResult, Option<NavStep>) {
        let (selector, alternatives) = match self.resolve_mark(mark_id, mark_to_xpath).await {
            Ok(found) => found,
            Err(e) => return (ActionResult::failed(e), None),
        };

        let known_ids: Vec<String> = match self.browser.pages().await {
            Ok(pages) => pages.iter().map(|p| p.id()).collect(),
            Err(_) => vec![self.page.id()],
        };

        match xpath::click(self.page.as_ref(), &selector, 0).await {
            Ok(true) => {}
            Ok(false) => {
                return (
                    ActionResult::failed(format!("element not clickable: {selector}")),
                    None,
                )
            }
            Err(e) => return (ActionResult::failed(e.to_string()), None),
        }

        // Race the click against a tab opening; adopt the new tab if one did
        match wait_for_new_page(self.browser, &known_ids, NEW_TAB_TIMEOUT).await {
            Ok(Some(new_page)) => {
                info!("click opened a new tab");
                self.previous_page = Some(SharedPage::clone(&self.page));
                self.page = new_page;
            }
            Ok(None) => {}
            Err(e) => debug!("new-tab watch failed: {e}"),
        }

        tokio::time::sleep(Duration::from_millis(500)).await;

        let result_url = self.page.current_url().await.ok();
        let step = NavStep {
            step: step_index,
            action: "click".into(),
            target_xpath: Some(selector),
            xpath_alternatives: alternatives.into_iter().take(5).collect(),
            text: target_text.map(str::to_string),
            value: None,
            key: None,
            result_url: result_url.clone(),
            success: true,
        };
        let mut result = ActionResult::ok();
        result.new_url = result_url;
        (result, Some(step))
    }

    #[allow(clippy::too_many_arguments)]
    async fn do_type(
        &mut self,
        mark_id: u64,
        text: &str,
        target_text: Option<&str>,
        expectation: Option<&str>,
        key: Option<&str>,
        mark_to_xpath: &HashMap<u64, Vec<String>>,
        step_index: usize,
    ) -> (ActionResult, Option<NavStep>) {
        let (selector, alternatives) = match self.resolve_mark(mark_id, mark_to_xpath).await {
            Ok(found) => found,
            Err(e) => return (ActionResult::failed(e), None),
        };

        // Focus, then fill
        if let Err(e) = xpath::click(self.page.as_ref(), &selector, 0).await {
            debug!("focus click failed for {selector}: {e}");
        }
        match xpath::fill(self.page.as_ref(), &selector, text, 0).await {
            Ok(true) => {}
            Ok(false) => return (ActionResult::failed(format!("cannot fill {selector}")), None),
            Err(e) => return (ActionResult::failed(e.to_string()), None),
        }

        // A search-ish target implies a confirming Enter
        let pressed_key = key.map(str::to_string).or_else(|| {
            let hint = format!(
                "{} {}",
                target_text.unwrap_or_default(),
                expectation.unwrap_or_default()
            )
            .to_lowercase();
            (hint.contains("search") || hint.contains("搜索")).then(|| "Enter".to_string())
        });

        if let Some(ref pressed) = pressed_key {
            if let Err(e) = self.page.keyboard_press(pressed).await {
                warn!("key press '{pressed}' failed: {e}");
            }
        }

        let step = NavStep {
            step: step_index,
            action: "type".into(),
            target_xpath: Some(selector),
            xpath_alternatives: alternatives.into_iter().take(5).collect(),
            text: target_text.map(str::to_string),
            value: Some(text.to_string()),
            key: pressed_key,
            result_url: self.page.current_url().await.ok(),
            success: true,
        };
        (ActionResult::ok(), Some(step))
    }

    async fn do_press(
        &mut self,
        mark_id: Option<u64>,
        key: &str,
        mark_to_xpath: &HashMap<u64, Vec<String>>,
        step_index: usize,
    ) -> (ActionResult, Option<NavStep>) {
        let mut target_xpath = None;
        if let Some(id) = mark_id {
            if let Ok((selector, _)) = self.resolve_mark(id, mark_to_xpath).await {
                let _ = xpath::click(self.page.as_ref(), &selector, 0).await;
                target_xpath = Some(selector);
            }
        }
        if let Err(e) = self.page.keyboard_press(key).await {
            return (ActionResult::failed(e.to_string()), None);
        }
        let step = NavStep {
            step: step_index,
            action: "press".into(),
            target_xpath,
            xpath_alternatives: Vec::new(),
            text: None,
            value: None,
            key: Some(key.to_string()),
            result_url: self.page.current_url().await.ok(),
            success: true,
        };
        (ActionResult::ok(), Some(step))
    }

    async fn do_scroll(
        &mut self,
        delta: Option<(f64, f64)>,
        step_index: usize,
    ) -> (ActionResult, Option<NavStep>) {
        let (dx, dy) = delta.unwrap_or((0.0, 300.0));
        if let Err(e) = self.page.scroll_by(dx, dy).await {
            return (ActionResult::failed(e.to_string()), None);
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        let step = NavStep {
            step: step_index,
            action: "scroll".into(),
            target_xpath: None,
            xpath_alternatives: Vec::new(),
            text: None,
            value: Some(format!("{dx},{dy}")),
            key: None,
            result_url: None,
            success: true,
        };
        (ActionResult::ok(), Some(step))
    }

    async fn do_navigate(&mut self, url: &str, step_index: usize) -> (ActionResult, Option<NavStep>) {
        if let Err(e) = self.page.goto(url, self.step_timeout).await {
            return (ActionResult::failed(e.to_string()), None);
        }
        let result_url = self.page.current_url().await.ok();
        let step = NavStep {
            step: step_index,
            action: "navigate".into(),
            target_xpath: None,
            xpath_alternatives: Vec::new(),
            text: None,
            value: Some(url.to_string()),
            key: None,
            result_url: result_url.clone(),
            success: true,
        };
        let mut result = ActionResult::ok();
        result.new_url = result_url;
        (result, Some(step))
    }

    async fn do_extract(
        &mut self,
        mark_id: Option<u64>,
        target_text: Option<&str>,
        mark_to_xpath: &HashMap<u64, Vec<String>>,
        step_index: usize,
    ) -> (ActionResult, Option<NavStep>) {
        let mut extracted = None;
        let mut used_xpath = None;

        if let Some(id) = mark_id {
            if let Ok((selector, _)) = self.resolve_mark(id, mark_to_xpath).await {
                let text = xpath::inner_text(self.page.as_ref(), &selector, 0)
                    .await
                    .ok()
                    .flatten();

                // A header cell usually means the caller wants the value
                // beside it, not the label itself
                let tag = xpath::tag_name(self.page.as_ref(), &selector, 0)
                    .await
                    .ok()
                    .flatten();
                if tag.as_deref() == Some("th") {
                    let sibling = format!("{selector}/following-sibling::td[1]");
                    match xpath::inner_text(self.page.as_ref(), &sibling, 0).await {
                        Ok(Some(td_text)) if !td_text.trim().is_empty() => {
                            extracted = Some(td_text);
                            used_xpath = Some(sibling);
                        }
                        _ => {
                            extracted = text;
                            used_xpath = Some(selector);
                        }
                    }
                } else {
                    extracted = text;
                    used_xpath = Some(selector);
                }
            }
        }

        // Mark resolution failed: find the text directly
        if extracted.is_none() {
            if let Some(text) = target_text.filter(|t| !t.trim().is_empty()) {
                let escaped = text.replace('\'', "\u{2019}");
                let by_text = format!("//*[contains(normalize-space(text()), '{escaped}')]");
                extracted = xpath::inner_text(self.page.as_ref(), &by_text, 0)
                    .await
                    .ok()
                    .flatten();
            }
        }

        let step = NavStep {
            step: step_index,
            action: "extract".into(),
            target_xpath: used_xpath,
            xpath_alternatives: Vec::new(),
            text: target_text.map(str::to_string),
            value: None,
            key: None,
            result_url: None,
            success: true,
        };
        let mut result = ActionResult::ok();
        result.extracted_text = extracted.map(|t| t.trim().to_string());
        (result, Some(step))
    }

    async fn do_go_back(&mut self) -> (ActionResult, Option<NavStep>) {
        if let Err(e) = self.page.go_back(self.step_timeout).await {
            return (ActionResult::failed(format!("cannot go back: {e}")), None);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        match self.page.current_url().await {
            Ok(url) => (ActionResult::ok_at(url), None),
            Err(_) => (ActionResult::ok(), None),
        }
    }

    /// Close the current tab and restore the prior one. The recorded
    /// previous page is preferred; otherwise the newest other page in the
    /// context is adopted.
    async fn do_go_back_tab(&mut self) -> (ActionResult, Option<NavStep>) {
        let current_id = self.page.id();

        let mut target = self
            .previous_page
            .take()
            .filter(|p| p.id() != current_id);

        if target.is_none() {
            if let Ok(pages) = self.browser.pages().await {
                target = pages.into_iter().rev().find(|p| p.id() != current_id);
            }
        }

        let Some(target) = target else {
            return (ActionResult::failed("no tab to switch back to"), None);
        };

        if !self.page.is_closed().await {
            if let Err(e) = self.page.close().await {
                debug!("closing current tab failed: {e}");
            }
        }

        self.page = target;
        match self.page.current_url().await {
            Ok(url) => (ActionResult::ok_at(url), None),
            Err(_) => (ActionResult::ok(), None),
        }
    }
}
