//! Pagination handling
//!
//! Finding and clicking the next-page control, in falling order of trust:
//! the xpath learned during exploration, a live vision ask, and a rule
//! library covering the usual text labels, chevron icons, framework icon
//! classes, and `rel=next`. A next-click must never leave the current tab;
//! if one opens it is closed and the attempt counts as a failure.

use std::time::Duration;

use log::{debug, info, warn};

use crate::browser::{wait_for_new_page, xpath, BrowserHandle, PageHandle};
use crate::checkpoint::JumpWidget;
use crate::config::CollectorConfig;
use crate::llm::decisions::PaginationDecision;
use crate::llm::{chat_for_message, LlmClient};
use crate::rate::AdaptiveRateController;
use crate::som::{
    capture_screenshot_base64, format_marks_for_llm, inject_and_scan, SoMSnapshot,
};
use crate::utils::sleep_jittered;

/// Visible texts that name a next-page control
const NEXT_TEXTS: [&str; 8] = ["下一页", "下页", "next", "Next", ">", "›", "»", "→"];

/// Rule-library selectors for the next-page control, tried in order
const NEXT_SELECTORS: [&str; 18] = [
    // Text labels, Chinese then English
    "//a[contains(normalize-space(), '下一页')]",
    "//button[contains(normalize-space(), '下一页')]",
    "//a[contains(normalize-space(), '下页')]",
    "//a[normalize-space()='Next' or normalize-space()='next' or normalize-space()='NEXT']",
    "//button[normalize-space()='Next' or normalize-space()='next']",
    // Bare chevrons
    "//a[normalize-space()='>' or normalize-space()='›' or normalize-space()='»']",
    "//button[normalize-space()='>' or normalize-space()='›' or normalize-space()='»']",
    // Framework icon classes
    "//button[.//*[contains(@class, 'icon-right')]][not(@disabled)]",
    "//button[.//*[contains(@class, 'el-icon-arrow-right')]][not(@disabled)]",
    "//button[.//*[contains(@class, 'anticon-right')]][not(@disabled)]",
    "//button[.//*[contains(@class, 'fa-chevron-right')]][not(@disabled)]",
    // Class names
    "a[class*=\"page-next\"]:not([class*=\"disabled\"])",
    "[class*=\"next\"]:not([class*=\"disabled\"]):not([disabled])",
    // Ids and aria labels
    "#next-page",
    "#nextPage",
    "a[aria-label*=\"next\" i]",
    "button[aria-label*=\"next\" i]",
    // Standards-compliant sites
    "a[rel=\"next\"]",
];

const PAGINATION_SYSTEM_PROMPT: &str = "\
You locate the next-page control on a list page screenshot where interactive \
elements carry numbered marks. Reply with JSON only: \
{\"action\": \"click\", \"args\": {\"mark_id\": <number>, \"target_text\": \
\"<its visible text>\"}} or {\"action\": \"not_found\", \"args\": \
{\"reasoning\": \"...\"}}";

/// Drives pagination for one collection run
pub struct PaginationHandler<'a> {
    browser: &'a dyn BrowserHandle,
    config: &'a CollectorConfig,
    /// Learned during exploration or restored from the collection config
    pub pagination_xpath: Option<String>,
    pub jump_widget: Option<JumpWidget>,
    pub current_page_num: u32,
}

impl<'a> PaginationHandler<'a> {
    #[must_use]
    pub fn new(browser: &'a dyn BrowserHandle, config: &'a CollectorConfig) -> Self {
        Self {
            browser,
            config,
            pagination_xpath: None,
            jump_widget: None,
            current_page_num: 1,
        }
    }

    /// Learn the pagination control's xpath from the current list page.
    /// Marks with next-page texts are preferred; a vision ask is the backup.
    pub async fn extract_pagination_xpath(
        &mut self,
        page: &dyn PageHandle,
        llm: Option<&dyn LlmClient>,
    ) -> Option<String> {
        let snapshot = match inject_and_scan(page).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("snapshot failed while extracting pagination: {e}");
                return None;
            }
        };

        if let Some(xpath) = find_next_mark_xpath(&snapshot) {
            info!("pagination control learned from marks: {xpath}");
            self.pagination_xpath = Some(xpath.clone());
            return Some(xpath);
        }

        if let Some(llm) = llm {
            if let Some(xpath) = self.ask_llm_for_next(page, llm, &snapshot).await {
                info!("pagination control learned from vision: {xpath}");
                self.pagination_xpath = Some(xpath.clone());
                return Some(xpath);
            }
        }

        info!("no pagination control found on the list page");
        None
    }

    /// Learn the page-jump widget (number input + confirm button) if the
    /// site has one; powers the second resume strategy
    pub async fn extract_jump_widget(&mut self, page: &dyn PageHandle) -> Option<JumpWidget> {
        let snapshot = inject_and_scan(page).await.ok()?;

        let input = snapshot.marks.iter().find(|mark| {
            mark.tag == "input"
                && (matches!(mark.input_type.as_deref(), Some("number") | Some("text") | None))
                && (mark_hint(mark).contains("页")
                    || mark_hint(mark).to_lowercase().contains("page")
                    || mark_hint(mark).to_lowercase().contains("goto"))
        })?;
        let button = snapshot.marks.iter().find(|mark| {
            matches!(mark.tag.as_str(), "button" | "a")
                && {
                    let text = mark.text.trim();
                    text == "确定" || text == "跳转" || text.eq_ignore_ascii_case("go")
                        || text.eq_ignore_ascii_case("jump")
                }
        })?;

        let widget = JumpWidget {
            input: input.xpath_candidates.first()?.xpath.clone(),
            button: button.xpath_candidates.first()?.xpath.clone(),
        };
        info!("jump widget learned: input={} button={}", widget.input, widget.button);
        self.jump_widget = Some(widget.clone());
        Some(widget)
    }

    /// Find and click the next-page control. On success the page number is
    /// incremented after the configured settle delay.
    pub async fn find_and_click_next(
        &mut self,
        page: &dyn PageHandle,
        llm: Option<&dyn LlmClient>,
        rate: &AdaptiveRateController,
    ) -> bool {
        // Strategy 1: the learned xpath
        if let Some(learned) = self.pagination_xpath.clone() {
            match self.try_click_selector(page, &learned, rate).await {
                Ok(true) => return true,
                Ok(false) => debug!("learned pagination xpath missed"),
                Err(e) => debug!("learned pagination xpath failed: {e}"),
            }
        }

        // Strategy 2: vision
        if let Some(llm) = llm {
            if let Ok(snapshot) = inject_and_scan(page).await {
                if let Some(xpath) = self.ask_llm_for_next(page, llm, &snapshot).await {
                    if matches!(self.try_click_selector(page, &xpath, rate).await, Ok(true)) {
                        // Remember for the following pages
                        self.pagination_xpath = Some(xpath);
                        return true;
                    }
                }
            }
            info!("vision pagination missed, falling back to rules");
        }

        // Strategy 3: the rule library
        for selector in NEXT_SELECTORS {
            match self.try_click_selector(page, selector, rate).await {
                Ok(true) => {
                    info!("pagination rule matched: {selector}");
                    return true;
                }
                Ok(false) => continue,
                Err(e) => {
                    debug!("pagination rule '{selector}' failed: {e}");
                    continue;
                }
            }
        }

        info!("no next-page control found, collection ends here");
        false
    }

    /// Click one candidate selector with the no-new-tab guard
    async fn try_click_selector(
        &mut self,
        page: &dyn PageHandle,
        selector: &str,
        rate: &AdaptiveRateController,
    ) -> crate::error::SpiderResult<bool> {
        let found = xpath::count(page, selector).await?;
        if found == 0 || !xpath::is_visible(page, selector, 0).await? {
            return Ok(false);
        }

        sleep_jittered(
            self.config.action_delay_base * rate.delay_multiplier(),
            self.config.action_delay_random,
        )
        .await;

        let known_ids: Vec<String> = match self.browser.pages().await {
            Ok(pages) => pages.iter().map(|p| p.id()).collect(),
            Err(_) => vec![page.id()],
        };

        if !xpath::click(page, selector, 0).await? {
            return Ok(false);
        }

        // Pagination must stay in this tab; a popup means we clicked the
        // wrong thing
        if let Ok(Some(new_page)) =
            wait_for_new_page(self.browser, &known_ids, Duration::from_millis(1500)).await
        {
            warn!("next-click opened a tab, closing it and treating as failure");
            let _ = new_page.close().await;
            return Ok(false);
        }

        tokio::time::sleep(Duration::from_secs_f64(self.config.page_load_delay)).await;
        self.current_page_num += 1;
        info!("advanced to page {}", self.current_page_num);
        Ok(true)
    }

    async fn ask_llm_for_next(
        &self,
        page: &dyn PageHandle,
        llm: &dyn LlmClient,
        snapshot: &SoMSnapshot,
    ) -> Option<String> {
        let (_, screenshot) = capture_screenshot_base64(page).await.ok()?;
        let user = format!(
            "Find the next-page control.\nMarked elements:\n{}",
            format_marks_for_llm(snapshot, 50)
        );
        let message = chat_for_message(llm, PAGINATION_SYSTEM_PROMPT, &user, &[screenshot])
            .await
            .ok()?;
        match PaginationDecision::from_message(&message).ok()? {
            PaginationDecision::NextControl { mark_id, target_text } => {
                // Prefer the id the model named when its element carries the
                // text; otherwise search marks for the text
                let mark = mark_id
                    .and_then(|id| snapshot.mark(id))
                    .filter(|mark| {
                        target_text.is_empty()
                            || crate::som::validator::texts_match(&target_text, mark.effective_text())
                    })
                    .or_else(|| {
                        snapshot.marks.iter().find(|mark| {
                            !target_text.is_empty()
                                && crate::som::validator::texts_match(
                                    &target_text,
                                    mark.effective_text(),
                                )
                        })
                    })?;
                mark.xpath_candidates.first().map(|c| c.xpath.clone())
            }
            PaginationDecision::NotFound { reasoning } => {
                debug!("vision says no pagination: {reasoning}");
                None
            }
        }
    }
}

fn mark_hint(mark: &crate::som::ElementMark) -> String {
    format!(
        "{} {} {}",
        mark.placeholder.as_deref().unwrap_or_default(),
        mark.aria_label.as_deref().unwrap_or_default(),
        mark.text
    )
}

/// Scan snapshot marks for a next-page control by text
fn find_next_mark_xpath(snapshot: &SoMSnapshot) -> Option<String> {
    for mark in &snapshot.marks {
        if !matches!(mark.tag.as_str(), "a" | "button" | "li" | "span") {
            continue;
        }
        let text = mark.effective_text().trim();
        let matched = NEXT_TEXTS
            .iter()
            .any(|next| text == *next || (text.len() <= 12 && text.contains(next)));
        if matched {
            return mark.xpath_candidates.first().map(|c| c.xpath.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::som::snapshot::{BoundingBox, ElementMark, XPathCandidate, XPathStrategy};

    fn mark(id: u64, tag: &str, text: &str) -> ElementMark {
        ElementMark {
            mark_id: id,
            tag: tag.into(),
            role: None,
            text: text.into(),
            aria_label: None,
            placeholder: None,
            title: None,
            value: None,
            href: None,
            input_type: None,
            bbox: BoundingBox::default(),
            center_normalized: (0.5, 0.5),
            xpath_candidates: vec![XPathCandidate {
                xpath: format!("//*[@data-mark='{id}']"),
                priority: 1,
                strategy: XPathStrategy::DataAttr,
                confidence: 0.9,
            }],
            is_visible: true,
        }
    }

    fn snapshot(marks: Vec<ElementMark>) -> SoMSnapshot {
        SoMSnapshot {
            url: "https://example.com/list".into(),
            title: String::new(),
            viewport_width: 1280,
            viewport_height: 720,
            marks,
            scroll_info: None,
            timestamp: 0,
        }
    }

    #[test]
    fn test_find_next_mark_by_chinese_text() {
        let snap = snapshot(vec![mark(1, "a", "首页"), mark(2, "a", "下一页")]);
        assert_eq!(
            find_next_mark_xpath(&snap).as_deref(),
            Some("//*[@data-mark='2']")
        );
    }

    #[test]
    fn test_find_next_mark_by_chevron() {
        let snap = snapshot(vec![mark(4, "button", "»")]);
        assert!(find_next_mark_xpath(&snap).is_some());
    }

    #[test]
    fn test_no_next_mark() {
        let snap = snapshot(vec![mark(1, "a", "home"), mark(2, "a", "about")]);
        assert!(find_next_mark_xpath(&snap).is_none());
    }
}
