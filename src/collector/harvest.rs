//! Collection phase
//!
//! After exploration the collector harvests detail URLs at scale. With a
//! learned detail-link template it walks every match per page (XPath mode);
//! without one it keeps asking the model page by page (LLM mode). Either
//! way, every page ends with the same bookkeeping: publish to the queue,
//! append to urls.txt, checkpoint progress, settle the rate controller, and
//! paginate.

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, info, warn};

use crate::actions::ActionExecutor;
use crate::browser::{wait_for_new_page, xpath, BrowserHandle, PageHandle};
use crate::checkpoint::{CollectionProgress, CollectionStatus, ProgressStore};
use crate::config::CollectorConfig;
use crate::llm::decisions::ExploreDecision;
use crate::llm::{chat_for_message, LlmClient};
use crate::pipeline::events::{PipelineEvent, PipelineEventBus};
use crate::queue::WorkQueue;
use crate::rate::AdaptiveRateController;
use crate::som::{
    build_mark_id_to_xpath_map, capture_screenshot_base64, format_marks_for_llm, inject_and_scan,
    resolve_mark_ids_from_map,
};
use crate::utils::resolve_href;

use super::pagination::PaginationHandler;
use super::url_extractor::extract_url_for_mark;

const SELECT_LINKS_SYSTEM_PROMPT: &str = "\
You list the detail-page links visible on a list page. Interactive elements \
carry numbered marks. Reply with JSON only: {\"action\": \"select\", \
\"args\": {\"purpose\": \"detail_links\", \"mark_id_text_map\": \
{\"<mark_id>\": \"<visible text>\", ...}}} or {\"action\": \"scroll\", \
\"args\": {}} when no unlisted links are visible.";

/// Outcome of a collection run
#[derive(Debug, Clone)]
pub struct CollectionOutcome {
    pub status: CollectionStatus,
    pub collected_count: usize,
    pub final_page: u32,
}

/// Harvests detail URLs from the list pages
pub struct UrlCollector<'a> {
    browser: &'a dyn BrowserHandle,
    llm: Option<&'a dyn LlmClient>,
    config: &'a CollectorConfig,
    queue: &'a dyn WorkQueue,
    progress_store: &'a ProgressStore,
    event_bus: Option<&'a PipelineEventBus>,
    pub rate: AdaptiveRateController,
    pub collected: HashSet<String>,
    pub progress: CollectionProgress,
}

impl<'a> UrlCollector<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        browser: &'a dyn BrowserHandle,
        llm: Option<&'a dyn LlmClient>,
        config: &'a CollectorConfig,
        queue: &'a dyn WorkQueue,
        progress_store: &'a ProgressStore,
        event_bus: Option<&'a PipelineEventBus>,
        rate: AdaptiveRateController,
        collected: HashSet<String>,
        progress: CollectionProgress,
    ) -> Self {
        Self {
            browser,
            llm,
            config,
            queue,
            progress_store,
            event_bus,
            rate,
            collected,
            progress,
        }
    }

    /// Collect using the learned detail-link template
    pub async fn collect_with_xpath(
        &mut self,
        page: &dyn PageHandle,
        detail_xpath: &str,
        pagination: &mut PaginationHandler<'_>,
    ) -> CollectionOutcome {
        info!("collecting with template: {detail_xpath}");

        loop {
            self.rate.pace().await;

            let page_urls = match self.harvest_page_with_xpath(page, detail_xpath).await {
                Ok(urls) => urls,
                Err(e) => {
                    warn!("page harvest failed: {e}");
                    self.rate.apply_penalty();
                    self.progress.backoff_level = self.rate.level();
                    self.progress.consecutive_success_pages = self.rate.consecutive_successes();
                    Vec::new()
                }
            };

            let fully_harvested = !page_urls.is_empty();
            self.publish_page(page_urls, pagination.current_page_num).await;
            if fully_harvested {
                self.rate.record_success();
                self.progress.backoff_level = self.rate.level();
                self.progress.consecutive_success_pages = self.rate.consecutive_successes();
            }

            if self.reached_limits(pagination.current_page_num) {
                return self.finish(CollectionStatus::Completed, pagination.current_page_num).await;
            }
            if !pagination.find_and_click_next(page, self.llm, &self.rate).await {
                return self.finish(CollectionStatus::Completed, pagination.current_page_num).await;
            }
        }
    }

    /// Collect by asking the model for detail links on every page
    pub async fn collect_with_llm(
        &mut self,
        executor: &mut ActionExecutor<'_>,
        task_description: &str,
        pagination: &mut PaginationHandler<'_>,
    ) -> CollectionOutcome {
        let Some(llm) = self.llm else {
            warn!("LLM mode requested without an LLM client");
            return self.finish(CollectionStatus::Failed, pagination.current_page_num).await;
        };
        info!("collecting in LLM mode");

        loop {
            self.rate.pace().await;

            let page_urls = self
                .harvest_page_with_llm(executor, llm, task_description)
                .await;
            let fully_harvested = !page_urls.is_empty();
            self.publish_page(page_urls, pagination.current_page_num).await;
            if fully_harvested {
                self.rate.record_success();
                self.progress.backoff_level = self.rate.level();
                self.progress.consecutive_success_pages = self.rate.consecutive_successes();
            }

            if self.reached_limits(pagination.current_page_num) {
                return self.finish(CollectionStatus::Completed, pagination.current_page_num).await;
            }
            let page = executor.page();
            if !pagination
                .find_and_click_next(page.as_ref(), self.llm, &self.rate)
                .await
            {
                return self.finish(CollectionStatus::Completed, pagination.current_page_num).await;
            }
        }
    }

    /// All new detail URLs on the current page, template-located
    async fn harvest_page_with_xpath(
        &mut self,
        page: &dyn PageHandle,
        detail_xpath: &str,
    ) -> crate::error::SpiderResult<Vec<String>> {
        let base_url = page.current_url().await?;
        let matched = xpath::count(page, detail_xpath).await?;
        debug!("template matches {matched} element(s) on {base_url}");

        let hrefs = xpath::attributes(page, detail_xpath, "href", matched).await?;
        let mut urls = Vec::new();
        for (nth, href) in hrefs.iter().enumerate() {
            let url = match href {
                Some(href) => resolve_href(&base_url, href),
                None => {
                    self.capture_url_by_click(page, detail_xpath, nth, &base_url)
                        .await
                }
            };
            if let Some(url) = url {
                if !urls.contains(&url) {
                    urls.push(url);
                }
            }
        }
        Ok(urls)
    }

    /// Click-and-capture for template matches without an href
    async fn capture_url_by_click(
        &self,
        page: &dyn PageHandle,
        detail_xpath: &str,
        nth: usize,
        base_url: &str,
    ) -> Option<String> {
        let known_ids: Vec<String> = match self.browser.pages().await {
            Ok(pages) => pages.iter().map(|p| p.id()).collect(),
            Err(_) => return None,
        };

        if !matches!(xpath::click(page, detail_xpath, nth).await, Ok(true)) {
            return None;
        }

        if let Ok(Some(new_page)) =
            wait_for_new_page(self.browser, &known_ids, Duration::from_secs(3)).await
        {
            let url = new_page.current_url().await.ok();
            let _ = new_page.close().await;
            return url;
        }

        let after = page.current_url().await.ok()?;
        if after != base_url {
            let _ = page.go_back(Duration::from_secs(10)).await;
            return Some(after);
        }
        None
    }

    /// One page of LLM-mode harvesting: inner scroll loop ending on repeated
    /// empty rounds or the page bottom
    async fn harvest_page_with_llm(
        &mut self,
        executor: &mut ActionExecutor<'_>,
        llm: &dyn LlmClient,
        task_description: &str,
    ) -> Vec<String> {
        let mut page_urls: Vec<String> = Vec::new();
        let mut empty_rounds = 0usize;

        for _ in 0..self.config.max_scrolls.max(1) {
            let page = executor.page();
            let snapshot = match inject_and_scan(page.as_ref()).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("LLM-mode snapshot failed: {e}");
                    break;
                }
            };
            let Ok((_, screenshot)) = capture_screenshot_base64(page.as_ref()).await else {
                break;
            };

            let user = format!(
                "Task: {task_description}\nAlready collected on this page: {}\nMarked elements:\n{}",
                page_urls.len(),
                format_marks_for_llm(&snapshot, 60)
            );
            let decision = chat_for_message(llm, SELECT_LINKS_SYSTEM_PROMPT, &user, &[screenshot])
                .await
                .and_then(|message| ExploreDecision::from_message(&message));

            let mut found_this_round = 0usize;
            match decision {
                Ok(ExploreDecision::SelectDetailLinks { mark_id_text_map }) => {
                    let resolved = match resolve_mark_ids_from_map(
                        page.as_ref(),
                        llm,
                        &snapshot,
                        &mark_id_text_map,
                        self.config.max_validation_retries,
                    )
                    .await
                    {
                        Ok(ids) => ids,
                        Err(e) => {
                            warn!("LLM-mode selection unresolved: {e}");
                            Vec::new()
                        }
                    };

                    let mark_map = build_mark_id_to_xpath_map(&snapshot);
                    let list_url = snapshot.url.clone();
                    for mark_id in resolved {
                        let Some(mark) = snapshot.mark(mark_id).cloned() else {
                            continue;
                        };
                        if let Some((url, _)) =
                            extract_url_for_mark(executor, &mark, &mark_map, &list_url, 0).await
                        {
                            if !page_urls.contains(&url) && !self.collected.contains(&url) {
                                page_urls.push(url);
                                found_this_round += 1;
                            }
                        }
                    }
                }
                Ok(ExploreDecision::Scroll) | Ok(ExploreDecision::Click { .. })
                | Ok(ExploreDecision::ReportDetailPage) => {}
                Err(e) => debug!("LLM-mode decision failed: {e}"),
            }

            if found_this_round == 0 {
                empty_rounds += 1;
                if empty_rounds >= self.config.no_new_url_threshold {
                    break;
                }
            } else {
                empty_rounds = 0;
            }

            if snapshot.at_bottom() {
                break;
            }
            let _ = executor.page().scroll_by(0.0, 500.0).await;
            tokio::time::sleep(Duration::from_secs_f64(self.config.scroll_delay)).await;
        }

        page_urls
    }

    /// Publish a page's harvest: queue first, urls.txt always, then the
    /// progress checkpoint (strictly after every URL was offered)
    async fn publish_page(&mut self, page_urls: Vec<String>, current_page: u32) {
        let new_urls: Vec<String> = page_urls
            .into_iter()
            .filter(|url| !self.collected.contains(url))
            .collect();

        if let Some(bus) = self.event_bus {
            let _ = bus.publish(PipelineEvent::page_harvested(
                current_page,
                new_urls.len(),
                self.collected.len() + new_urls.len(),
            ));
        }

        if !new_urls.is_empty() {
            match self.queue.push_batch(&new_urls, None).await {
                Ok(pushed) => debug!("queued {pushed}/{} new URL(s)", new_urls.len()),
                // A lost queue must not lose data; urls.txt still gets them
                Err(e) => warn!("queue push failed, relying on urls.txt: {e}"),
            }
            if let Err(e) = self.progress_store.append_urls(&new_urls).await {
                warn!("urls.txt append failed: {e}");
            }
            for url in &new_urls {
                self.collected.insert(url.clone());
            }
            self.progress.collected_count = self.collected.len();
            info!(
                "page {current_page}: {} new URL(s), {} total",
                new_urls.len(),
                self.collected.len()
            );
        } else {
            info!("page {current_page}: no new URLs");
        }

        self.progress.current_page_num = current_page.max(self.progress.current_page_num);
        if let Err(e) = self.progress_store.save_progress(&mut self.progress).await {
            warn!("progress checkpoint failed: {e}");
        }
    }

    fn reached_limits(&self, current_page: u32) -> bool {
        if self.collected.len() >= self.config.target_url_count {
            info!("target URL count {} reached", self.config.target_url_count);
            return true;
        }
        if current_page >= self.config.max_pages {
            info!("page limit {} reached", self.config.max_pages);
            return true;
        }
        false
    }

    async fn finish(&mut self, status: CollectionStatus, final_page: u32) -> CollectionOutcome {
        self.progress.status = status;
        self.progress.current_page_num = final_page.max(self.progress.current_page_num);
        if let Err(e) = self.progress_store.save_progress(&mut self.progress).await {
            warn!("final progress checkpoint failed: {e}");
        }
        CollectionOutcome {
            status,
            collected_count: self.collected.len(),
            final_page: self.progress.current_page_num,
        }
    }
}
