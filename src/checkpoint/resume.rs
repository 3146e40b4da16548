//! Resume strategies
//!
//! Three ways back to page K, tried in order: rewrite the page parameter in
//! the URL, drive the jump widget learned during exploration, or skip ahead
//! page by page checking only the first detail link. The coordinator never
//! fails; when everything misses, collection restarts from page 1.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};

use crate::browser::{xpath, PageHandle};
use crate::utils::urls::{detect_page_param, read_page_param, resolve_href, rewrite_page_param};

use super::config_store::JumpWidget;

/// One way of getting back to a target page
#[async_trait]
pub trait ResumeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Try to land on `target_page`. Returns (success, page actually reached).
    async fn try_resume(&self, page: &dyn PageHandle, target_page: u32) -> (bool, u32);
}

/// Strategy one: rewrite the page parameter in the list URL
pub struct UrlPatternStrategy {
    list_url: String,
    page_param: Option<String>,
    goto_timeout: Duration,
}

impl UrlPatternStrategy {
    #[must_use]
    pub fn new(list_url: &str, goto_timeout: Duration) -> Self {
        Self {
            list_url: list_url.to_string(),
            page_param: detect_page_param(list_url),
            goto_timeout,
        }
    }

    /// Which standard page key the URL carries, if any
    #[must_use]
    pub fn detected_param(&self) -> Option<&str> {
        self.page_param.as_deref()
    }
}

#[async_trait]
impl ResumeStrategy for UrlPatternStrategy {
    fn name(&self) -> &'static str {
        "url-rewrite"
    }

    async fn try_resume(&self, page: &dyn PageHandle, target_page: u32) -> (bool, u32) {
        let Some(param) = &self.page_param else {
            info!("[url-rewrite] no page parameter in list URL");
            return (false, 1);
        };
        let Some(target_url) = rewrite_page_param(&self.list_url, param, target_page) else {
            return (false, 1);
        };

        info!("[url-rewrite] jumping to {target_url}");
        if let Err(e) = page.goto(&target_url, self.goto_timeout).await {
            warn!("[url-rewrite] navigation failed: {e}");
            return (false, 1);
        }

        // Verify against the landed URL; redirects can silently drop the
        // parameter
        match page.current_url().await {
            Ok(current) if read_page_param(&current, param) == Some(target_page) => {
                info!("[url-rewrite] landed on page {target_page}");
                (true, target_page)
            }
            _ => {
                info!("[url-rewrite] landed URL failed verification");
                (false, 1)
            }
        }
    }
}

/// Strategy two: fill the learned page input and click its button
pub struct WidgetJumpStrategy {
    widget: Option<JumpWidget>,
    settle: Duration,
}

impl WidgetJumpStrategy {
    #[must_use]
    pub fn new(widget: Option<JumpWidget>) -> Self {
        Self {
            widget,
            settle: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl ResumeStrategy for WidgetJumpStrategy {
    fn name(&self) -> &'static str {
        "jump-widget"
    }

    async fn try_resume(&self, page: &dyn PageHandle, target_page: u32) -> (bool, u32) {
        let Some(widget) = &self.widget else {
            info!("[jump-widget] no widget recorded");
            return (false, 1);
        };

        match xpath::count(page, &widget.input).await {
            Ok(n) if n > 0 => {}
            _ => {
                info!("[jump-widget] page input not found");
                return (false, 1);
            }
        }
        if !matches!(
            xpath::fill(page, &widget.input, &target_page.to_string(), 0).await,
            Ok(true)
        ) {
            info!("[jump-widget] could not fill page input");
            return (false, 1);
        }

        match xpath::count(page, &widget.button).await {
            Ok(n) if n > 0 => {}
            _ => {
                info!("[jump-widget] confirm button not found");
                return (false, 1);
            }
        }
        if !matches!(xpath::click(page, &widget.button, 0).await, Ok(true)) {
            info!("[jump-widget] confirm click failed");
            return (false, 1);
        }

        tokio::time::sleep(self.settle).await;
        info!("[jump-widget] jumped to page {target_page}");
        (true, target_page)
    }
}

/// Selectors for the previous-page control, used when stepping back
const PREV_SELECTORS: [&str; 5] = [
    "//a[contains(text(), '上一页')]",
    "//button[contains(text(), '上一页')]",
    "//a[contains(translate(text(), 'PREV', 'prev'), 'prev')]",
    "//*[contains(@class, 'prev')]//a",
    "//li[contains(@class, 'pagination-prev')]/button",
];

/// Strategy three: skip already-collected pages by checking only the first
/// detail link, stepping back one page on the first new URL so entries that
/// shifted between runs are not lost
pub struct SmartSkipStrategy {
    collected_urls: HashSet<String>,
    detail_xpath: Option<String>,
    pagination_xpath: Option<String>,
    page_settle: Duration,
}

impl SmartSkipStrategy {
    #[must_use]
    pub fn new(
        collected_urls: HashSet<String>,
        detail_xpath: Option<String>,
        pagination_xpath: Option<String>,
    ) -> Self {
        Self {
            collected_urls,
            detail_xpath,
            pagination_xpath,
            page_settle: Duration::from_secs(1),
        }
    }

    async fn first_detail_url(&self, page: &dyn PageHandle) -> Option<String> {
        let detail_xpath = self.detail_xpath.as_deref()?;
        let href = xpath::attribute(page, detail_xpath, "href", 0)
            .await
            .ok()
            .flatten()?;
        let base = page.current_url().await.ok()?;
        resolve_href(&base, &href)
    }

    async fn click_next(&self, page: &dyn PageHandle) -> bool {
        let Some(pagination) = self.pagination_xpath.as_deref() else {
            return false;
        };
        if !matches!(xpath::count(page, pagination).await, Ok(n) if n > 0) {
            return false;
        }
        let disabled = xpath::attribute(page, pagination, "disabled", 0)
            .await
            .ok()
            .flatten()
            .is_some();
        let class = xpath::attribute(page, pagination, "class", 0)
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        if disabled || class.contains("disabled") {
            return false;
        }
        if !matches!(xpath::click(page, pagination, 0).await, Ok(true)) {
            return false;
        }
        tokio::time::sleep(self.page_settle).await;
        true
    }

    async fn click_prev(&self, page: &dyn PageHandle) -> bool {
        for selector in PREV_SELECTORS {
            if matches!(xpath::count(page, selector).await, Ok(n) if n > 0)
                && matches!(xpath::is_visible(page, selector, 0).await, Ok(true))
                && matches!(xpath::click(page, selector, 0).await, Ok(true))
            {
                tokio::time::sleep(self.page_settle).await;
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl ResumeStrategy for SmartSkipStrategy {
    fn name(&self) -> &'static str {
        "skip-ahead"
    }

    async fn try_resume(&self, page: &dyn PageHandle, target_page: u32) -> (bool, u32) {
        if self.detail_xpath.is_none() || self.pagination_xpath.is_none() {
            info!("[skip-ahead] missing xpath configuration");
            return (false, 1);
        }
        if self.collected_urls.is_empty() {
            info!("[skip-ahead] nothing collected yet, starting at page 1");
            return (true, 1);
        }

        let mut current_page = 1u32;
        let max_skip = target_page.saturating_add(10);

        while current_page < max_skip {
            let Some(first_url) = self.first_detail_url(page).await else {
                info!("[skip-ahead] cannot read first detail URL on page {current_page}");
                break;
            };

            if self.collected_urls.contains(&first_url) {
                if !self.click_next(page).await {
                    info!("[skip-ahead] cannot paginate past page {current_page}");
                    break;
                }
                current_page += 1;
                continue;
            }

            // First new entry: one page back covers entries that were
            // pushed forward by new postings since the last run
            if current_page > 1 && self.click_prev(page).await {
                current_page -= 1;
            }
            info!("[skip-ahead] located resume point at page {current_page}");
            return (true, current_page);
        }

        info!("[skip-ahead] stopped at page {current_page}");
        (true, current_page)
    }
}

/// Runs the strategies in priority order; never fails
pub struct ResumeCoordinator {
    strategies: Vec<Box<dyn ResumeStrategy>>,
}

impl ResumeCoordinator {
    #[must_use]
    pub fn new(
        list_url: &str,
        collected_urls: HashSet<String>,
        jump_widget: Option<JumpWidget>,
        detail_xpath: Option<String>,
        pagination_xpath: Option<String>,
        goto_timeout: Duration,
    ) -> Self {
        Self {
            strategies: vec![
                Box::new(UrlPatternStrategy::new(list_url, goto_timeout)),
                Box::new(WidgetJumpStrategy::new(jump_widget)),
                Box::new(SmartSkipStrategy::new(
                    collected_urls,
                    detail_xpath,
                    pagination_xpath,
                )),
            ],
        }
    }

    /// Resume to `target_page`, returning the page actually reached
    pub async fn resume_to_page(&self, page: &dyn PageHandle, target_page: u32) -> u32 {
        info!("resuming to page {target_page}");
        for strategy in &self.strategies {
            let (success, actual) = strategy.try_resume(page, target_page).await;
            if success {
                info!("strategy '{}' reached page {actual}", strategy.name());
                return actual;
            }
            info!("strategy '{}' failed, trying next", strategy.name());
        }
        warn!("all resume strategies failed, restarting from page 1");
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_pattern_detection() {
        let strategy = UrlPatternStrategy::new(
            "https://example.com/list?page=2&kw=x",
            Duration::from_secs(30),
        );
        assert_eq!(strategy.detected_param(), Some("page"));

        let none = UrlPatternStrategy::new(
            "https://example.com/list?start=10",
            Duration::from_secs(30),
        );
        assert_eq!(none.detected_param(), None);
    }
}
